pub use tessera_core::prelude::*;
pub use tessera_core::util::Counter as _;
