use std::pin::Pin;

use bytes::Bytes;
use futures_util::Stream;

use crate::error::Result;

/// Number of bytes newly moved since the previous progress item.
///
/// A blob that is already present locally reports a single item equal to its
/// full size, so summing items always accounts for the complete content.
pub type Progress = u64;

/// Stream of transfer progress updates.
pub type ProgressStream = Pin<Box<dyn Stream<Item = Result<Progress>> + Send>>;

/// Stream of raw content chunks flowing into or out of the store.
pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;
