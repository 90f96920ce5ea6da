//! Tri-color abstraction used to mark reachability during a collection
//! cycle. `Blue` objects have never been allocated into; `Black`/`White`
//! alternate roles as "the current allocation color" and "the current
//! sweep-target color" from one cycle to the next.

/// `Blue = 0`, `Black = 1`, `White = 2`.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Color {
    Blue = 0,
    Black = 1,
    White = 2,
}

impl Color {
    /// Swaps `Black` and `White`; `Blue` is left untouched since a
    /// never-allocated object is not part of either side of the flip.
    pub fn flip(self) -> Color {
        match self {
            Color::Black => Color::White,
            Color::White => Color::Black,
            Color::Blue => Color::Blue,
        }
    }
}

impl Default for Color {
    fn default() -> Self {
        Color::Blue
    }
}
