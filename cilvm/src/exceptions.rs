//! Managed exceptions and the per-frame region state machine.
//!
//! Raising never unwinds the host stack inside a frame: the frame's regions
//! are searched and control transfers to a handler offset. Only when no
//! region of the frame applies does the exception leave the interpreter loop
//! as a [`VmError::Exception`].

use std::fmt;

use log::trace;

use crate::{
    ExceptionRegion, MethodId, ObjectRef, RegionKind, TypeRegistry, VmError,
    object::is_assignable_to, visitor::RootVisitor,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TraceFrame {
    pub method: MethodId,
    pub il_offset: u32,
}

/// A thrown object together with the frames it has unwound through,
/// innermost first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedException {
    pub object: ObjectRef,
    pub trace: Vec<TraceFrame>,
}

impl ManagedException {
    pub fn new(object: ObjectRef) -> Self {
        Self {
            object,
            trace: Vec::new(),
        }
    }
}

impl fmt::Display for ManagedException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.object.type_id() {
            Some(ty) => write!(
                f,
                "object {:#x} of type #{} ({} frames)",
                self.object.address(),
                ty.0,
                self.trace.len()
            ),
            None => write!(f, "null"),
        }
    }
}

/// Runtime-wide exception bookkeeping.
#[derive(Debug, Default)]
pub struct ExceptionEngine {
    last_thrown: Option<ObjectRef>,
    raised: usize,
}

impl ExceptionEngine {
    /// Records `object` as the most recent exception and wraps it for
    /// propagation.
    pub fn throw(&mut self, object: ObjectRef) -> VmError {
        self.last_thrown = Some(object);
        self.raised += 1;
        VmError::Exception(ManagedException::new(object))
    }

    pub fn last_thrown(&self) -> Option<ObjectRef> {
        self.last_thrown
    }

    pub fn raised(&self) -> usize {
        self.raised
    }

    /// Appends a frame to the trace of a managed exception passing through
    /// it. Other errors are left alone.
    pub fn attach_frame(error: &mut VmError, frame: TraceFrame) {
        if let VmError::Exception(exception) = error {
            exception.trace.push(frame);
        }
    }

    pub fn visit_roots(&mut self, visitor: &mut impl RootVisitor) {
        if let Some(object) = self.last_thrown.as_mut() {
            visitor.visit_object(object);
        }
    }
}

/// What the interpreter does next after a region transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transfer {
    /// Continue at `target`; when `exception` is set the operand stack holds
    /// exactly that object.
    Jump {
        target: u32,
        exception: Option<ObjectRef>,
    },
    /// No region of this frame applies, the exception leaves the method.
    Propagate(ManagedException),
}

#[derive(Debug, Clone)]
enum FinallyExit {
    /// a `leave` from `from` to `target` still has to visit the finally
    /// regions from `next` on
    Leave { from: u32, target: u32, next: usize },
    /// an exception raised at `offset` resumes its search from `next`
    Unwind {
        exception: ManagedException,
        offset: u32,
        next: usize,
    },
}

#[derive(Debug, Clone)]
enum HandlerContext {
    Catch { region: usize, exception: ObjectRef },
    Finally { region: usize, exit: FinallyExit },
}

impl HandlerContext {
    fn region(&self) -> usize {
        match self {
            Self::Catch { region, .. } | Self::Finally { region, .. } => *region,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RegionPhase {
    Running,
    InHandler,
    InFinally,
}

/// Handlers a frame is currently executing, innermost last.
#[derive(Debug, Default, Clone)]
pub struct RegionState {
    contexts: Vec<HandlerContext>,
}

impl RegionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> RegionPhase {
        match self.contexts.last() {
            None => RegionPhase::Running,
            Some(HandlerContext::Catch { .. }) => RegionPhase::InHandler,
            Some(HandlerContext::Finally { .. }) => RegionPhase::InFinally,
        }
    }

    /// Exception of the innermost catch handler, what `rethrow` throws.
    pub fn current_exception(&self) -> Option<ObjectRef> {
        self.contexts.iter().rev().find_map(|context| match context {
            HandlerContext::Catch { exception, .. } => Some(*exception),
            HandlerContext::Finally { .. } => None,
        })
    }

    /// Drops the handlers control leaves when it moves to `target`.
    fn exit_handlers(&mut self, regions: &[ExceptionRegion], target: u32) {
        while let Some(context) = self.contexts.last() {
            if regions[context.region()].handler_contains(target) {
                break;
            }
            self.contexts.pop();
        }
    }

    /// Searches the regions for the first one whose try block covers
    /// `offset` and that applies to the exception.
    pub fn raise(
        &mut self,
        types: &TypeRegistry,
        regions: &[ExceptionRegion],
        exception: ManagedException,
        offset: u32,
    ) -> Transfer {
        self.search(types, regions, exception, offset, 0)
    }

    fn search(
        &mut self,
        types: &TypeRegistry,
        regions: &[ExceptionRegion],
        exception: ManagedException,
        offset: u32,
        start: usize,
    ) -> Transfer {
        let actual = exception.object.type_id();
        for (index, region) in regions.iter().enumerate().skip(start) {
            if !region.try_contains(offset) {
                continue;
            }
            match region.kind {
                RegionKind::Catch(catch_type) => {
                    let matches = actual
                        .is_some_and(|ty| is_assignable_to(types, ty, catch_type));
                    if !matches {
                        continue;
                    }
                    trace!("catch region {index} takes exception at {offset:#x}");
                    self.exit_handlers(regions, region.handler_offset);
                    self.contexts.push(HandlerContext::Catch {
                        region: index,
                        exception: exception.object,
                    });
                    return Transfer::Jump {
                        target: region.handler_offset,
                        exception: Some(exception.object),
                    };
                }
                RegionKind::Finally => {
                    trace!("finally region {index} runs while unwinding from {offset:#x}");
                    self.exit_handlers(regions, region.handler_offset);
                    self.contexts.push(HandlerContext::Finally {
                        region: index,
                        exit: FinallyExit::Unwind {
                            exception,
                            offset,
                            next: index + 1,
                        },
                    });
                    return Transfer::Jump {
                        target: region.handler_offset,
                        exception: None,
                    };
                }
            }
        }
        self.contexts.clear();
        Transfer::Propagate(exception)
    }

    /// Starts a `leave` from `from` to `target` and returns where execution
    /// continues: the first finally handler on the way, or the target.
    pub fn leave(
        &mut self,
        regions: &[ExceptionRegion],
        from: u32,
        target: u32,
    ) -> u32 {
        // a leave out of a catch handler ends that handler
        while let Some(HandlerContext::Catch { region, .. }) = self.contexts.last() {
            let handler = &regions[*region];
            if !handler.handler_contains(from) || handler.handler_contains(target) {
                break;
            }
            self.contexts.pop();
        }
        self.continue_leave(regions, from, target, 0)
    }

    fn continue_leave(
        &mut self,
        regions: &[ExceptionRegion],
        from: u32,
        target: u32,
        start: usize,
    ) -> u32 {
        let pending = regions.iter().enumerate().skip(start).find(|(_, region)| {
            region.kind == RegionKind::Finally
                && region.try_contains(from)
                && !region.try_contains(target)
        });
        match pending {
            Some((index, region)) => {
                trace!("leave {from:#x} -> {target:#x} runs finally region {index}");
                self.contexts.push(HandlerContext::Finally {
                    region: index,
                    exit: FinallyExit::Leave {
                        from,
                        target,
                        next: index + 1,
                    },
                });
                region.handler_offset
            }
            None => target,
        }
    }

    /// Ends the innermost finally handler: resumes a pending leave or keeps
    /// unwinding the exception that entered it.
    pub fn end_finally(
        &mut self,
        types: &TypeRegistry,
        regions: &[ExceptionRegion],
    ) -> Result<Transfer, VmError> {
        let Some(HandlerContext::Finally { exit, .. }) = self.contexts.pop() else {
            return Err(VmError::invalid("endfinally outside of a finally handler"));
        };
        Ok(match exit {
            FinallyExit::Leave { from, target, next } => Transfer::Jump {
                target: self.continue_leave(regions, from, target, next),
                exception: None,
            },
            FinallyExit::Unwind {
                exception,
                offset,
                next,
            } => self.search(types, regions, exception, offset, next),
        })
    }

    pub fn visit_roots(&mut self, visitor: &mut impl RootVisitor) {
        for context in &mut self.contexts {
            match context {
                HandlerContext::Catch { exception, .. } => {
                    visitor.visit_object(exception);
                }
                HandlerContext::Finally {
                    exit: FinallyExit::Unwind { exception, .. },
                    ..
                } => visitor.visit_object(&mut exception.object),
                HandlerContext::Finally { .. } => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Allocator, Heap, TypeId, layout};

    fn region(kind: RegionKind, try_: (u32, u32), handler: (u32, u32)) -> ExceptionRegion {
        ExceptionRegion {
            kind,
            try_offset: try_.0,
            try_length: try_.1 - try_.0,
            handler_offset: handler.0,
            handler_length: handler.1 - handler.0,
        }
    }

    fn prepared() -> TypeRegistry {
        let mut types = TypeRegistry::new();
        layout::prepare(&mut types).expect("prepare");
        types
    }

    fn throw(heap: &mut Heap, types: &TypeRegistry, ty: TypeId) -> ManagedException {
        ManagedException::new(heap.allocate_object(types, ty).expect("exception"))
    }

    #[test]
    fn nested_finally_blocks_run_innermost_first() {
        let types = prepared();
        // try { try { leave 100 } finally { 20..30 } } finally { 30..40 }
        let regions = [
            region(RegionKind::Finally, (0, 20), (20, 30)),
            region(RegionKind::Finally, (0, 30), (30, 40)),
        ];
        let mut state = RegionState::new();
        assert_eq!(state.leave(&regions, 10, 100), 20);
        assert_eq!(state.phase(), RegionPhase::InFinally);
        assert_eq!(
            state.end_finally(&types, &regions).expect("inner"),
            Transfer::Jump { target: 30, exception: None }
        );
        assert_eq!(
            state.end_finally(&types, &regions).expect("outer"),
            Transfer::Jump { target: 100, exception: None }
        );
        assert_eq!(state.phase(), RegionPhase::Running);
        assert!(state.end_finally(&types, &regions).is_err());
    }

    #[test]
    fn leave_within_a_try_skips_its_own_finally() {
        let regions = [region(RegionKind::Finally, (0, 20), (20, 30))];
        let mut state = RegionState::new();
        assert_eq!(state.leave(&regions, 4, 12), 12);
        assert_eq!(state.phase(), RegionPhase::Running);
    }

    #[test]
    fn first_matching_catch_wins() {
        let types = prepared();
        let wk = types.well_known.clone();
        let mut heap = Heap::new(1 << 16);
        let regions = [
            region(RegionKind::Catch(wk.invalid_cast_exception), (0, 10), (10, 20)),
            region(RegionKind::Catch(wk.arithmetic_exception), (0, 10), (20, 30)),
            region(RegionKind::Catch(wk.exception), (0, 10), (30, 40)),
        ];
        let exception = throw(&mut heap, &types, wk.divide_by_zero_exception);
        let object = exception.object;
        let mut state = RegionState::new();
        assert_eq!(
            state.raise(&types, &regions, exception, 5),
            Transfer::Jump { target: 20, exception: Some(object) }
        );
        assert_eq!(state.current_exception(), Some(object));
        // leaving the handler ends it
        assert_eq!(state.leave(&regions, 25, 40), 40);
        assert_eq!(state.current_exception(), None);
    }

    #[test]
    fn finally_rethrows_into_the_enclosing_catch() {
        let types = prepared();
        let wk = types.well_known.clone();
        let mut heap = Heap::new(1 << 16);
        // try { try { throw } finally { 10..20 } } catch (Exception) { 20..30 }
        let regions = [
            region(RegionKind::Finally, (0, 10), (10, 20)),
            region(RegionKind::Catch(wk.exception), (0, 20), (20, 30)),
        ];
        let exception = throw(&mut heap, &types, wk.overflow_exception);
        let object = exception.object;
        let mut state = RegionState::new();
        assert_eq!(
            state.raise(&types, &regions, exception, 3),
            Transfer::Jump { target: 10, exception: None }
        );
        assert_eq!(
            state.end_finally(&types, &regions).expect("end finally"),
            Transfer::Jump { target: 20, exception: Some(object) }
        );
    }

    #[test]
    fn unmatched_exceptions_propagate() {
        let types = prepared();
        let wk = types.well_known.clone();
        let mut heap = Heap::new(1 << 16);
        let regions = [
            region(RegionKind::Catch(wk.invalid_cast_exception), (0, 10), (10, 20)),
            region(RegionKind::Finally, (0, 10), (20, 30)),
        ];
        let exception = throw(&mut heap, &types, wk.null_reference_exception);
        let mut state = RegionState::new();
        assert_eq!(
            state.raise(&types, &regions, exception.clone(), 2),
            Transfer::Jump { target: 20, exception: None }
        );
        assert_eq!(
            state.end_finally(&types, &regions).expect("end finally"),
            Transfer::Propagate(exception.clone())
        );
        // outside every try block
        assert_eq!(
            state.raise(&types, &regions, exception.clone(), 15),
            Transfer::Propagate(exception)
        );
    }

    #[test]
    fn throwing_from_a_handler_abandons_it() {
        let types = prepared();
        let wk = types.well_known.clone();
        let mut heap = Heap::new(1 << 16);
        // try { try { } catch { throw at 15 } } catch { 20..30 }
        let regions = [
            region(RegionKind::Catch(wk.exception), (0, 10), (10, 20)),
            region(RegionKind::Catch(wk.exception), (0, 20), (20, 30)),
        ];
        let first = throw(&mut heap, &types, wk.exception);
        let second = throw(&mut heap, &types, wk.exception);
        let second_object = second.object;
        let mut state = RegionState::new();
        state.raise(&types, &regions, first, 5);
        assert_eq!(
            state.raise(&types, &regions, second, 15),
            Transfer::Jump { target: 20, exception: Some(second_object) }
        );
        assert_eq!(state.current_exception(), Some(second_object));
        assert_eq!(state.leave(&regions, 25, 30), 30);
        assert_eq!(state.phase(), RegionPhase::Running);
    }
}
