pub mod grnam;
pub mod pwnam;

#[cfg(feature = "cgroups")]
pub mod cgroups;
