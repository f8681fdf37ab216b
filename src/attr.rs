//! Page and region attributes.

use core::fmt;

bitflags::bitflags! {
    /// Attributes of a region, or the attributes requested of an allocation.
    ///
    /// The low two bits encode the [`Speed`] class. The remaining flags are
    /// independent of one another:
    ///
    /// | Bits   | Meaning                         | Used on           |
    /// |--------|---------------------------------|-------------------|
    /// | 0..=1  | speed class                     | regions, requests |
    /// | 2      | DMA-capable                     | regions, requests |
    /// | 3      | cache-coherent                  | regions, requests |
    /// | 4      | persistent                      | regions, requests |
    /// | 8      | part of a virtual mapping       | requests          |
    /// | 9      | no speed-class fallback         | requests          |
    /// | 10     | identical re-reservation is ok  | requests          |
    pub struct PageAttr: u32 {
        /// Mask selecting the speed class. Use [`PageAttr::speed`] to read it.
        const SPEED_MASK = 0b11;
        /// The memory is reachable by DMA-capable devices.
        const DMA = 1 << 2;
        /// The memory is cache-coherent with devices.
        const COHERENT = 1 << 3;
        /// The memory keeps its contents across resets.
        const PERSISTENT = 1 << 4;

        /// The allocation will be part of a virtual mapping.
        ///
        /// Pages are recorded as [`Mapped`] instead of [`Fixed`].
        ///
        /// [`Mapped`]: crate::PageState::Mapped
        /// [`Fixed`]: crate::PageState::Fixed
        const MAPPED = 1 << 8;
        /// Never serve the request from a region of another speed class.
        const NO_SPEED_FALLBACK = 1 << 9;
        /// A reservation may re-affirm an identical existing reservation.
        const REALLOC = 1 << 10;

        /// The flags that describe memory rather than a request.
        const REGION_MASK = Self::SPEED_MASK.bits
            | Self::DMA.bits
            | Self::COHERENT.bits
            | Self::PERSISTENT.bits;
    }
}

impl PageAttr {
    /// Slow memory, such as memory behind an external bus.
    pub const SLOW: PageAttr = PageAttr::from_speed(Speed::Slow);
    /// Normal memory. This is the speed class of ordinary system RAM.
    pub const NORMAL: PageAttr = PageAttr::from_speed(Speed::Normal);
    /// Fast memory, such as on-chip SRAM.
    pub const FAST: PageAttr = PageAttr::from_speed(Speed::Fast);
    /// The fastest memory, such as tightly coupled memory.
    pub const FASTEST: PageAttr = PageAttr::from_speed(Speed::Fastest);

    /// Returns the attributes with only the speed class set.
    pub const fn from_speed(speed: Speed) -> PageAttr {
        PageAttr::from_bits_truncate(speed as u32)
    }

    /// Returns the speed class.
    pub const fn speed(self) -> Speed {
        Speed::from_bits(self.bits)
    }

    /// Returns `self` with the speed class replaced by `speed`.
    pub fn with_speed(self, speed: Speed) -> PageAttr {
        (self - PageAttr::SPEED_MASK) | PageAttr::from_speed(speed)
    }

    /// Returns only the attributes that describe memory.
    pub fn region_attrs(self) -> PageAttr {
        self & PageAttr::REGION_MASK
    }
}

/// A relative memory performance tier.
///
/// The numeric encoding is the value of the [`PageAttr::SPEED_MASK`] bits.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Speed {
    /// Slow memory.
    Slow = 0,
    /// Normal memory.
    Normal = 1,
    /// Fast memory.
    Fast = 2,
    /// The fastest memory.
    Fastest = 3,
}

impl Speed {
    /// The number of speed classes.
    pub const COUNT: usize = 4;

    /// All speed classes, slowest first.
    pub const ALL: [Speed; Speed::COUNT] = [Speed::Slow, Speed::Normal, Speed::Fast, Speed::Fastest];

    /// Decodes the speed class from the low two bits of `bits`.
    pub const fn from_bits(bits: u32) -> Speed {
        match bits & PageAttr::SPEED_MASK.bits {
            0 => Speed::Slow,
            1 => Speed::Normal,
            2 => Speed::Fast,
            _ => Speed::Fastest,
        }
    }
}

impl fmt::Display for Speed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Speed::Slow => "slow",
            Speed::Normal => "normal",
            Speed::Fast => "fast",
            Speed::Fastest => "fastest",
        };

        f.write_str(name)
    }
}

impl fmt::Display for PageAttr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.speed())?;

        for (flag, name) in [
            (PageAttr::DMA, "dma"),
            (PageAttr::COHERENT, "coherent"),
            (PageAttr::PERSISTENT, "persistent"),
        ] {
            if self.contains(flag) {
                write!(f, "|{name}")?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speed_round_trips_through_attr() {
        for speed in Speed::ALL {
            let attr = PageAttr::DMA.with_speed(speed);
            assert_eq!(attr.speed(), speed);
            assert!(attr.contains(PageAttr::DMA));
        }
    }

    #[test]
    fn with_speed_replaces_previous_speed() {
        let attr = PageAttr::FASTEST | PageAttr::COHERENT;
        let slowed = attr.with_speed(Speed::Slow);

        assert_eq!(slowed.speed(), Speed::Slow);
        assert_eq!(slowed, PageAttr::COHERENT);
    }

    #[test]
    fn region_attrs_drop_request_modifiers() {
        let req = PageAttr::FAST | PageAttr::DMA | PageAttr::MAPPED | PageAttr::REALLOC;
        assert_eq!(req.region_attrs(), PageAttr::FAST | PageAttr::DMA);
    }
}
