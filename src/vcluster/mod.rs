/// Virtual clusters running inside a main cluster
pub mod client;

pub use client::VclusterClient;
