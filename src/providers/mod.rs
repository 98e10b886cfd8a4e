//! Backend implementations of the shoes contract

pub mod aws;
pub mod lxd;
pub mod openstack;

pub use aws::AwsShoes;
pub use lxd::LxdShoes;
pub use openstack::OpenStackShoes;
