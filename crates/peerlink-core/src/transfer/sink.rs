//! Byte sinks backing a transfer.

use std::io::{Read, Seek, Write};

/// Seekable byte source/destination of a transfer.
///
/// Sending transfers read from it, receiving transfers write to it. Any
/// `Read + Write + Seek + Send` type qualifies, including [`std::fs::File`]
/// and [`std::io::Cursor`] over a `Vec<u8>`.
pub trait DataSink: Read + Write + Seek + Send {}

impl<T: Read + Write + Seek + Send> DataSink for T {}
