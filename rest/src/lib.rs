#![warn(missing_docs)]
//! Orchestration HTTP surface of the control plane.
//!
//! Only the endpoints the core depends on live here: the netboot
//! script handler every machine hits on boot, and the core-agent
//! payload protocol used by the in-VM agents to register themselves
//! and poll for state. The user-facing CRUD api, identity and RBAC are
//! separate services and out of scope.

pub mod v0;
