//! Client for the OCI distribution protocol with a local content-addressed
//! store conforming to the OCI image layout specification.
//!
//! [`Registry`] speaks the HTTP protocol against one registry host,
//! [`Layout`] owns the on-disk blob store and index, and [`Client`] ties the
//! two together into resumable, concurrency-bounded pull and push
//! operations with verified, atomically published content.

pub mod error;
pub mod layout;
pub mod oci;
pub mod registry;
pub mod transfer;

mod client;
mod metadata;

pub use client::{Client, ClientConfig};
pub use error::{Error, Result};
pub use layout::Layout;
pub use oci::digest::{Algorithm, Digest};
pub use oci::image::{Descriptor, Index, Manifest, Platform, PlatformSelector};
pub use oci::reference::Reference;
pub use registry::{Registry, RegistryConfig, Repository};
pub use transfer::TransferCoordinator;
