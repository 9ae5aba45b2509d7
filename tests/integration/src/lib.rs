//! End-to-end tests across the kit crates
//!
//! This test suite validates:
//! - Factory provisioning of a device over PRVS
//! - Trust list and firmware distribution from a gateway over FLDT
//! - Update triggers through INFO start notifications and INFV announcements

pub mod test_utils;

#[cfg(test)]
mod factory_provisioning_tests;

#[cfg(test)]
mod file_distribution_tests;
