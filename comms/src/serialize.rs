/// Types that can be written into a frame body.
pub trait Serialize<'a> {
    /// Writes the head of the body into `buf`.
    ///
    /// # Arguments
    /// * `buf` - The buffer holding the bytes to send.
    ///
    /// # Returns
    /// An optional tail that is sent right after `buf` without being copied.
    fn serialize(&'a self, buf: &mut Vec<u8>) -> Option<&'a [u8]>;
}
