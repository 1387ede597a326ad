//! # Weft Permissions
//!
//! Permission model for resource subscriptions.
//!
//! ## Overview
//!
//! Every subscription is granted one of three levels: `Reject`, `Read` or
//! `Write`. The server decides the level through a [`PermissionPolicy`]
//! when the subscription arrives and tells the client with a PERMISSION
//! command. Clients only echo local writes upstream under `Write`, and a
//! `Reject` cancels the resource.
//!
//! ## Usage
//!
//! ```rust
//! use weft_perms::{GrantTable, Permission, PermissionPolicy, Scope, SessionInfo};
//!
//! let policy = GrantTable::new(Permission::Read)
//!     .grant(Scope::Prefix("drafts/".into()), Permission::Write);
//!
//! let session = SessionInfo::default();
//! assert_eq!(policy.decide("drafts/today", &session), Permission::Write);
//! assert_eq!(policy.decide("archive/2020", &session), Permission::Read);
//! ```

pub mod error;
pub mod permission;
pub mod policy;

pub use error::{PermsError, Result};
pub use permission::Permission;
pub use policy::{Grant, GrantTable, PermissionPolicy, Scope, SessionInfo, StaticPolicy};
