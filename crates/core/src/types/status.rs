//! Status enums shared by catalog snapshots and cart lines.

use serde::{Deserialize, Serialize};

/// Availability of a purchasable variant at the time it was captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StockStatus {
    #[default]
    InStock,
    LowStock,
    OutOfStock,
    Discontinued,
}

impl StockStatus {
    /// Whether the variant can currently be added to a cart.
    #[must_use]
    pub const fn is_available(&self) -> bool {
        matches!(self, Self::InStock | Self::LowStock)
    }

    /// Derive a status from a remaining stock count.
    ///
    /// `None` means the stock is not tracked, which counts as in stock.
    #[must_use]
    pub const fn from_remaining(remaining: Option<u32>, low_threshold: u32) -> Self {
        match remaining {
            None => Self::InStock,
            Some(0) => Self::OutOfStock,
            Some(n) if n <= low_threshold => Self::LowStock,
            Some(_) => Self::InStock,
        }
    }
}

impl std::fmt::Display for StockStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InStock => write!(f, "in_stock"),
            Self::LowStock => write!(f, "low_stock"),
            Self::OutOfStock => write!(f, "out_of_stock"),
            Self::Discontinued => write!(f, "discontinued"),
        }
    }
}

impl std::str::FromStr for StockStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_stock" => Ok(Self::InStock),
            "low_stock" => Ok(Self::LowStock),
            "out_of_stock" => Ok(Self::OutOfStock),
            "discontinued" => Ok(Self::Discontinued),
            _ => Err(format!("invalid stock status: {s}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_remaining() {
        assert_eq!(StockStatus::from_remaining(None, 3), StockStatus::InStock);
        assert_eq!(StockStatus::from_remaining(Some(0), 3), StockStatus::OutOfStock);
        assert_eq!(StockStatus::from_remaining(Some(2), 3), StockStatus::LowStock);
        assert_eq!(StockStatus::from_remaining(Some(9), 3), StockStatus::InStock);
    }

    #[test]
    fn test_round_trip_through_str() {
        for status in [
            StockStatus::InStock,
            StockStatus::LowStock,
            StockStatus::OutOfStock,
            StockStatus::Discontinued,
        ] {
            assert_eq!(status.to_string().parse::<StockStatus>(), Ok(status));
        }
        assert!("bogus".parse::<StockStatus>().is_err());
    }
}
