//! The per-object header word: an atomic machine word packing `color`
//! (2 low bits), a `tag` (next 8 bits), and a layout-descriptor payload
//! in the remaining bits. `Tracer` decodes the payload; the collector
//! only ever touches `color`/`tag`.
//!
//! Bit layout: `{color: B2, tag: B8, descriptor: B54}`.

use modular_bitfield::prelude::*;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::color::Color;

#[bitfield(bits = 64)]
#[derive(Copy, Clone, Debug)]
pub struct HeaderFields {
    pub color: B2,
    pub tag: B8,
    pub descriptor: B54,
}

/// The atomic cell stored in object storage, immediately preceding the
/// payload for small objects and following the large-block metadata
/// prefix for large objects. `Tracer` implementations decode the full
/// word via `decode`; the collector only manipulates `color`.
#[repr(transparent)]
pub struct Header(AtomicU64);

impl Header {
    pub fn new(color: Color, tag: u8, descriptor: u64) -> Self {
        let fields = HeaderFields::new()
            .with_color(color as u8)
            .with_tag(tag)
            .with_descriptor(descriptor);
        Header(AtomicU64::new(u64::from_le_bytes(fields.into_bytes())))
    }

    #[inline]
    pub fn decode(&self, ordering: Ordering) -> HeaderFields {
        HeaderFields::from_bytes(self.0.load(ordering).to_le_bytes())
    }

    #[inline]
    pub fn color(&self, ordering: Ordering) -> Color {
        match self.decode(ordering).color() {
            0 => Color::Blue,
            1 => Color::Black,
            _ => Color::White,
        }
    }

    /// CASes just the color field, release-on-success/acquire-on-failure,
    /// leaving tag and descriptor untouched. Used by the marker to claim
    /// an object (pre-image logging happens-before this recolor) and by
    /// the mutator's cycle-boundary recolor.
    #[inline]
    pub fn try_recolor(&self, expected: Color, new: Color) -> bool {
        loop {
            let cur = self.0.load(Ordering::Acquire);
            let fields = HeaderFields::from_bytes(cur.to_le_bytes());
            let cur_color = match fields.color() {
                0 => Color::Blue,
                1 => Color::Black,
                _ => Color::White,
            };
            if cur_color != expected {
                return false;
            }
            let next = fields.with_color(new as u8);
            let next_word = u64::from_le_bytes(next.into_bytes());
            match self
                .0
                .compare_exchange(cur, next_word, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(_) => continue,
            }
        }
    }

    /// Unconditionally stores a new color, e.g. while constructing a
    /// freshly allocated object's header.
    pub fn set_color(&self, color: Color, ordering: Ordering) {
        loop {
            let cur = self.0.load(Ordering::Acquire);
            let fields = HeaderFields::from_bytes(cur.to_le_bytes()).with_color(color as u8);
            let next = u64::from_le_bytes(fields.into_bytes());
            if self
                .0
                .compare_exchange(cur, next, ordering, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    pub fn tag(&self, ordering: Ordering) -> u8 {
        self.decode(ordering).tag()
    }

    pub fn descriptor(&self, ordering: Ordering) -> u64 {
        self.decode(ordering).descriptor()
    }
}

/// Both small- and large-object layouts place the header word in the
/// eight bytes immediately preceding the user payload; this is the one
/// piece of layout knowledge the core needs without consulting `Tracer`.
#[inline]
pub unsafe fn header_of(payload: *mut u8) -> &'static Header {
    &*(payload.sub(8) as *const Header)
}

/// Writes a fresh header word at `ptr`, for initializing a just-carved
/// cell or block. No atomicity is needed here: nothing else can observe
/// this memory until the allocating mutator hands the pointer out.
#[inline]
pub unsafe fn init_header(ptr: *mut u8, color: Color, tag: u8, descriptor: u64) {
    let fields = HeaderFields::new()
        .with_color(color as u8)
        .with_tag(tag)
        .with_descriptor(descriptor);
    *(ptr as *mut u64) = u64::from_le_bytes(fields.into_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_color_tag_descriptor() {
        let h = Header::new(Color::Black, 7, 0x1234);
        assert_eq!(h.color(Ordering::Acquire), Color::Black);
        assert_eq!(h.tag(Ordering::Acquire), 7);
        assert_eq!(h.descriptor(Ordering::Acquire), 0x1234);
    }

    #[test]
    fn try_recolor_fails_on_color_mismatch() {
        let h = Header::new(Color::Black, 0, 0);
        assert!(!h.try_recolor(Color::White, Color::Blue));
        assert_eq!(h.color(Ordering::Acquire), Color::Black);
        assert!(h.try_recolor(Color::Black, Color::White));
        assert_eq!(h.color(Ordering::Acquire), Color::White);
    }
}
