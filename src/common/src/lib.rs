use crate::system::HostResources;

#[macro_use]
extern crate lazy_static;

lazy_static! {
    pub static ref HOST: HostResources = HostResources::detect();
}

#[macro_use]
pub mod sqlite_helpers;
pub mod system;
