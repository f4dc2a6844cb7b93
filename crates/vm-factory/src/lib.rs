//! Pre-warmed sandbox VM acquisition.
//!
//! [`VmFactory`] picks one backing at construction and hands out running
//! VMs sized for each request:
//!
//! | Backing | Base VMs come from |
//! |---|---|
//! | [`Template`] | restoring a saved, paused template VM |
//! | [`RemoteCache`] | a [`CacheServer`] in another process |
//! | [`Direct`] | booting a fresh VM per request |
//!
//! Any backing can sit behind a [`VmCache`] that keeps ready VMs in memory.

mod cache;
mod config;
mod direct;
mod factory;
mod remote;
mod template;

#[cfg(test)]
mod testing;

pub use cache::VmCache;
pub use config::{DEFAULT_TEMPLATE_PATH, FactoryConfig, load};
pub use direct::Direct;
pub use factory::{ConfigMismatch, VmFactory, check_vm_config};
pub use remote::{CacheServer, CacheStatus, RemoteCache, bind};
pub use template::{AGENT_SETTLE_TIME, Template, TemplateOptions, TemplatePaths};
