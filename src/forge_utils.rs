pub mod common;
pub mod inspect;

pub use self::common::ContractSpec;
pub use self::inspect::{ForgeInspect, InspectField};
