/// Receive buffer element types whose alignment is at least 4 bytes.
///
/// Frames are read into a buffer of these so that `f32` payloads can be
/// viewed in place after the 4 byte kind header.
pub trait Align4: bytemuck::Pod {}

impl Align4 for u32 {}
impl Align4 for i32 {}
impl Align4 for u64 {}
impl Align4 for i64 {}
impl Align4 for f32 {}
impl Align4 for f64 {}
