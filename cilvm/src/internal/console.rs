use crate::{
    CallContext, VmError,
    internal::{display_value, format_primitive},
};

/// Text of the single argument, formatted by its declared type.
fn argument_text(context: &mut CallContext<'_>) -> Result<String, VmError> {
    let Some(&param) = context.rt.types.method(context.method).signature.params.first() else {
        return Ok(String::new());
    };
    let value = context.arg(0)?;
    match context.rt.types.ty(param).primitive_kind() {
        Some(kind) => format_primitive(kind, value),
        None => display_value(context.rt, value),
    }
}

pub fn write_line(context: &mut CallContext<'_>) -> Result<(), VmError> {
    let text = argument_text(context)?;
    context.rt.console.write_line(&text);
    Ok(())
}

pub fn write(context: &mut CallContext<'_>) -> Result<(), VmError> {
    let text = argument_text(context)?;
    context.rt.console.write(&text);
    Ok(())
}
