use std::alloc::{self, Layout};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

/// An owned, zero-initialized heap buffer aligned to `ALIGN` bytes.
///
/// `ALIGN` is checked when the type is instantiated: a non power of two fails
/// to compile.
///
/// ```rust
/// use buffers::AlignedBuffer;
///
/// let mut node = AlignedBuffer::<8>::zeroed(1024);
/// node[0] = 1;
/// assert_eq!(node.as_ptr() as usize % 8, 0);
/// ```
///
/// ```compile_fail
/// let _ = buffers::AlignedBuffer::<24>::zeroed(16);
/// ```
pub struct AlignedBuffer<const ALIGN: usize> {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the buffer uniquely owns its allocation; shared access only hands
// out `&[u8]`.
unsafe impl<const ALIGN: usize> Send for AlignedBuffer<ALIGN> {}
unsafe impl<const ALIGN: usize> Sync for AlignedBuffer<ALIGN> {}

impl<const ALIGN: usize> AlignedBuffer<ALIGN> {
    const ALIGN_OK: () = assert!(ALIGN.is_power_of_two(), "ALIGN must be a power of two");

    /// Allocates `len` zero bytes.
    ///
    /// Aborts through [`alloc::handle_alloc_error`] if the allocator fails,
    /// as `Vec` does.
    pub fn zeroed(len: usize) -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::ALIGN_OK;

        let layout = Self::layout(len);
        // SAFETY: the layout has a non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(raw) else {
            alloc::handle_alloc_error(layout);
        };
        Self { ptr, len }
    }

    /// Raw pointer to the first byte. Never dangling, even for `len == 0`.
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn layout(len: usize) -> Layout {
        // A zero-length request still allocates one byte so the pointer is real.
        match Layout::from_size_align(len.max(1), ALIGN) {
            Ok(layout) => layout,
            Err(_) => panic!("aligned buffer of {len} bytes overflows isize"),
        }
    }
}

impl<const ALIGN: usize> Deref for AlignedBuffer<ALIGN> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: `ptr` is valid for `len` initialized bytes for the lifetime of `self`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl<const ALIGN: usize> DerefMut for AlignedBuffer<ALIGN> {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl<const ALIGN: usize> Drop for AlignedBuffer<ALIGN> {
    fn drop(&mut self) {
        // SAFETY: allocated in `zeroed` with exactly this layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), Self::layout(self.len)) }
    }
}

impl<const ALIGN: usize> std::fmt::Debug for AlignedBuffer<ALIGN> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBuffer")
            .field("align", &ALIGN)
            .field("len", &self.len)
            .finish()
    }
}
