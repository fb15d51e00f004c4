/// Lima VM hosting the main cluster
pub mod client;
pub mod template;

pub use client::LimaClient;
pub use template::VmTemplate;
