//! Array geometry: translating a physical drive position into its role
//! inside a RAID-6 stripe.
//!
//! Convention: physical position 0 carries row parity, position 1 carries
//! diagonal parity, and data columns start at position 2 with logical data
//! index `position - 2`. Logical data index 0 is the special (non-S) symbol
//! column of the even-odd layout.

use serde::{Deserialize, Serialize};

use crate::{MAX_POSITIONS, PositionBitmask};

/// Role of one physical position inside a stripe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PositionKind {
    RowParity,
    DiagParity,
    /// Data column with its logical index (0-based, 0 = non-S column).
    Data(u32),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GeometryError {
    #[error("position {position} out of range for width {width}")]
    PositionOutOfRange { position: u32, width: u32 },
    #[error("array width {width} not in 3..={max}", max = MAX_POSITIONS)]
    InvalidWidth { width: u32 },
}

/// Fixed geometry of one array as the engine needs it: just enough to map
/// positions to stripe roles and build legality masks for the validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaidGeometry {
    width: u32,
}

impl RaidGeometry {
    /// RAID-6 needs two parity columns and at least one data column.
    pub fn new(width: u32) -> Result<Self, GeometryError> {
        if width < 3 || width > MAX_POSITIONS {
            return Err(GeometryError::InvalidWidth { width });
        }
        Ok(Self { width })
    }

    pub fn width(self) -> u32 {
        self.width
    }

    pub fn position_kind(self, position: u32) -> Result<PositionKind, GeometryError> {
        if position >= self.width {
            return Err(GeometryError::PositionOutOfRange {
                position,
                width: self.width,
            });
        }
        Ok(match position {
            0 => PositionKind::RowParity,
            1 => PositionKind::DiagParity,
            data => PositionKind::Data(data - 2),
        })
    }

    pub fn row_parity_mask(self) -> PositionBitmask {
        PositionBitmask::single(0)
    }

    pub fn diag_parity_mask(self) -> PositionBitmask {
        PositionBitmask::single(1)
    }

    pub fn parity_mask(self) -> PositionBitmask {
        self.row_parity_mask().union(self.diag_parity_mask())
    }

    /// Mask of all data positions.
    pub fn data_mask(self) -> PositionBitmask {
        let all = (1u32 << self.width) - 1;
        PositionBitmask::new((all & !0b11) as u16)
    }

    /// Mask of the non-S data column (logical data index 0).
    pub fn non_s_data_mask(self) -> PositionBitmask {
        PositionBitmask::single(2)
    }

    /// Mask of data columns that can hold an S symbol (logical index > 0).
    pub fn s_data_mask(self) -> PositionBitmask {
        let all = (1u32 << self.width) - 1;
        PositionBitmask::new((all & !0b111) as u16)
    }

    pub fn data_columns(self) -> u32 {
        self.width - 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_degenerate_widths() {
        assert!(RaidGeometry::new(2).is_err());
        assert!(RaidGeometry::new(MAX_POSITIONS + 1).is_err());
        assert!(RaidGeometry::new(6).is_ok());
    }

    #[test]
    fn position_roles() {
        let geo = RaidGeometry::new(6).unwrap();
        assert_eq!(geo.position_kind(0).unwrap(), PositionKind::RowParity);
        assert_eq!(geo.position_kind(1).unwrap(), PositionKind::DiagParity);
        assert_eq!(geo.position_kind(2).unwrap(), PositionKind::Data(0));
        assert_eq!(geo.position_kind(5).unwrap(), PositionKind::Data(3));
        assert!(geo.position_kind(6).is_err());
    }

    #[test]
    fn masks_partition_the_stripe() {
        let geo = RaidGeometry::new(6).unwrap();
        let all = geo.parity_mask().union(geo.data_mask());
        assert_eq!(all.bits(), 0b11_1111);
        assert!(!geo.parity_mask().intersects(geo.data_mask()));
        assert!(geo.non_s_data_mask().is_subset_of(geo.data_mask()));
        assert!(!geo.s_data_mask().contains(2));
    }
}
