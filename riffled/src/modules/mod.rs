//! Built-in module classes: enough to source, queue, and sink traffic
//! without external drivers.

mod port_inc;
mod port_out;
mod queue;
mod sink;
mod source;

pub use port_inc::PORT_INC_CLASS;
pub use port_out::PORT_OUT_CLASS;
pub use queue::QUEUE_CLASS;
pub use sink::SINK_CLASS;
pub use source::SOURCE_CLASS;

use crate::module::ModuleClass;

pub fn builtin_module_classes() -> Vec<&'static ModuleClass> {
    vec![
        &SOURCE_CLASS,
        &SINK_CLASS,
        &QUEUE_CLASS,
        &PORT_INC_CLASS,
        &PORT_OUT_CLASS,
    ]
}
