pub mod cache;
pub mod service;
pub mod source;
pub mod store;

pub use cache::IndexCache;
pub use service::{RunOptions, TemplateService};
pub use source::{HttpTemplateSource, TemplateSource};
pub use store::TemplateStore;
