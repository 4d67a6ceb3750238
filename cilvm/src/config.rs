/// Host-facing knobs for a [`Runtime`](crate::Runtime). Every field is an
/// override; unset fields fall back to [`RuntimeSettings::default`].
#[derive(Debug, Default, Clone)]
pub struct RuntimeCreateInfo {
    /// bytes of the bump allocator backing operand stacks, locals and call data
    pub stack_size: Option<usize>,
    /// initial bytes of the large-struct side-stack, it grows on demand
    pub struct_stack_capacity: Option<usize>,
    /// maximum bytes the heap hands out before reporting exhaustion
    pub heap_limit: Option<usize>,
    pub max_call_depth: Option<usize>,
    pub echo_console: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub stack_size: usize,
    pub struct_stack_capacity: usize,
    pub heap_limit: usize,
    pub max_call_depth: usize,
    pub echo_console: bool,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            stack_size: 1024 * 1024,
            struct_stack_capacity: 4096,
            heap_limit: 256 * 1024 * 1024,
            max_call_depth: 1024,
            echo_console: true,
        }
    }
}

impl RuntimeSettings {
    pub fn from_info(info: &RuntimeCreateInfo) -> Self {
        let mut settings = Self::default();
        info.stack_size.inspect(|&val| settings.stack_size = val);
        info.struct_stack_capacity
            .inspect(|&val| settings.struct_stack_capacity = val);
        info.heap_limit.inspect(|&val| settings.heap_limit = val);
        info.max_call_depth
            .inspect(|&val| settings.max_call_depth = val);
        info.echo_console.inspect(|&val| settings.echo_console = val);
        settings
    }
}
