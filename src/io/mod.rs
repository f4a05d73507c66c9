//! File I/O: the framed object file format and readout persistence seam.

pub mod raw;
pub mod writer;

pub use raw::{ContentType, RawObjectReader, RawObjectWriter, FILE_MAGIC};
pub use writer::{ReadoutFileWriter, ReadoutWriter, WriterSubscriber};
