mod init;
mod placement;
mod tree;

pub use init::{ConstParamGen, ParamGen, TruncatedNormalGen};
pub use placement::{Device, OnDevice};
pub use tree::TensorTree;
