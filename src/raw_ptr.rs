/// Carries a `*const T` into a `'static` closure dispatched onto the
/// worker pool. Sound only where the enclosing call blocks on a latch
/// before returning, so every pointee outlives every job that can read it
/// — the same justification as `ComponentRegistry`'s unchecked mutable
/// accessor, generalized into one reusable wrapper instead of repeating
/// the cast at each call site.
pub(crate) struct RawRef<T: ?Sized>(*const T);

unsafe impl<T: ?Sized> Send for RawRef<T> {}
unsafe impl<T: ?Sized> Sync for RawRef<T> {}

impl<T: ?Sized> Clone for RawRef<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T: ?Sized> Copy for RawRef<T> {}

impl<T: ?Sized> RawRef<T> {
    pub fn new(value: &T) -> Self {
        Self(value as *const T)
    }

    /// # Safety
    /// The pointee must still be alive and not mutably aliased elsewhere.
    pub unsafe fn get(self) -> &'static T {
        &*self.0
    }
}
