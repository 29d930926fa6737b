//! Tower middleware used to assemble the underlying HTTP client.

mod option;
mod timeout;

pub use self::option::{OptionLayer, OptionLayerExt, OptionService};
pub use self::timeout::{Timeout, TimeoutLayer};
