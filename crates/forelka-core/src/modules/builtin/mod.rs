//! Modules compiled into the host. They load before any directory module.

use std::sync::Arc;

use crate::modules::Module;

pub mod alias;
pub mod help;
pub mod loader;
pub mod owner;
pub mod ping;
pub mod prefix;

pub const DEVELOPER: &str = "forelka";

pub fn all() -> Vec<(&'static str, Arc<dyn Module>)> {
    vec![
        ("help", Arc::new(help::HelpModule)),
        ("ping", Arc::new(ping::PingModule)),
        ("prefix", Arc::new(prefix::PrefixModule)),
        ("alias", Arc::new(alias::AliasModule)),
        ("owner", Arc::new(owner::OwnerModule)),
        ("loader", Arc::new(loader::LoaderModule)),
    ]
}
