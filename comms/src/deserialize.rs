use std::io;

/// The inverse of `Serialize`, borrowing from the received frame.
pub trait Deserialize<'a>: Sized {
    /// Decodes a whole frame, `InvalidData` if it is not a valid `Self`.
    fn deserialize(buf: &'a [u8]) -> io::Result<Self>;
}
