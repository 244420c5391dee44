//! Proxmox VE cluster autoscaler service
//!
//! Configuration loading and the HTTP probe surface, shared by the
//! binary and its integration tests.

pub mod api;
pub mod config;
