//! Grid geometry and the single-step movement rule.
//!
//! Zones are square blocks of `zone_size × zone_size` cells laid out
//! row-major, `zone_line` zones per row. Zone `z` borders `z - 1`, `z + 1`,
//! `z - zone_line` and `z + zone_line`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Rows and columns per zone unless configured otherwise.
pub const DEFAULT_ZONE_SIZE: u32 = 8;

/// Zones per grid row unless configured otherwise.
pub const DEFAULT_ZONE_LINE: u32 = 4;

// ---------------------------------------------------------------------------
// Direction
// ---------------------------------------------------------------------------

/// One of the four move directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// `row + 1`.
    Up,
    /// `row - 1`.
    Down,
    /// `col + 1`.
    Left,
    /// `col - 1`.
    Right,
}

impl Direction {
    /// All directions, in declaration order.
    pub const ALL: [Direction; 4] = [
        Direction::Up,
        Direction::Down,
        Direction::Left,
        Direction::Right,
    ];

    /// Lowercase name, as accepted by [`FromStr`].
    pub fn name(self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
            Direction::Left => "left",
            Direction::Right => "right",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error returned when a string names no direction.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown direction `{0}`")]
pub struct ParseDirectionError(pub String);

impl FromStr for Direction {
    type Err = ParseDirectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        Direction::ALL
            .into_iter()
            .find(|d| d.name() == lowered)
            .ok_or_else(|| ParseDirectionError(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Geometry
// ---------------------------------------------------------------------------

/// Size of a zone and width of the zone grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GridDimensions {
    /// Rows and columns per zone.
    pub zone_size: u32,
    /// Zones per grid row.
    pub zone_line: u32,
}

impl Default for GridDimensions {
    fn default() -> Self {
        Self {
            zone_size: DEFAULT_ZONE_SIZE,
            zone_line: DEFAULT_ZONE_LINE,
        }
    }
}

impl GridDimensions {
    /// Whether `(row, col)` lies inside a zone.
    pub fn contains(&self, cell: Cell) -> bool {
        cell.row < self.zone_size && cell.col < self.zone_size
    }
}

/// One cell of the world: a zone and a position inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cell {
    /// Zone index.
    pub zone: u32,
    /// Row inside the zone.
    pub row: u32,
    /// Column inside the zone.
    pub col: u32,
}

impl Cell {
    /// Build a cell.
    pub const fn new(zone: u32, row: u32, col: u32) -> Self {
        Self { zone, row, col }
    }

    /// Cell `(0, 0)` of `zone`, where new players spawn.
    pub const fn origin(zone: u32) -> Self {
        Self::new(zone, 0, 0)
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, zone {})", self.row, self.col, self.zone)
    }
}

// ---------------------------------------------------------------------------
// Movement
// ---------------------------------------------------------------------------

/// Destination of a one-cell move from `from` in `direction`.
///
/// Up/down change the row, left/right the column; note that left *adds* to
/// the column. Leaving a zone wraps into the neighbouring zone. Returns
/// `None` when the destination zone index would be negative. Whether the
/// destination zone exists is the caller's concern.
pub fn step(from: Cell, direction: Direction, dims: GridDimensions) -> Option<Cell> {
    let size = i64::from(dims.zone_size);
    let line = i64::from(dims.zone_line);
    let mut zone = i64::from(from.zone);
    let mut row = i64::from(from.row);
    let mut col = i64::from(from.col);

    match direction {
        Direction::Up => row += 1,
        Direction::Down => row -= 1,
        Direction::Left => col += 1,
        Direction::Right => col -= 1,
    }

    // A single step changes one axis, so at most one branch fires.
    if row >= size {
        row -= size;
        zone += line;
    } else if row < 0 {
        row += size;
        zone -= line;
    } else if col >= size {
        col -= size;
        zone += 1;
    } else if col < 0 {
        col += size;
        zone -= 1;
    }

    Some(Cell {
        zone: u32::try_from(zone).ok()?,
        row: u32::try_from(row).ok()?,
        col: u32::try_from(col).ok()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIMS: GridDimensions = GridDimensions {
        zone_size: 8,
        zone_line: 4,
    };

    #[test]
    fn test_axis_and_sign_convention() {
        let from = Cell::new(5, 3, 3);
        assert_eq!(step(from, Direction::Up, DIMS), Some(Cell::new(5, 4, 3)));
        assert_eq!(step(from, Direction::Down, DIMS), Some(Cell::new(5, 2, 3)));
        assert_eq!(step(from, Direction::Left, DIMS), Some(Cell::new(5, 3, 4)));
        assert_eq!(step(from, Direction::Right, DIMS), Some(Cell::new(5, 3, 2)));
    }

    #[test]
    fn test_row_overflow_moves_one_grid_row_down() {
        let from = Cell::new(1, 7, 2);
        assert_eq!(step(from, Direction::Up, DIMS), Some(Cell::new(5, 0, 2)));
    }

    #[test]
    fn test_row_underflow_moves_one_grid_row_up() {
        let from = Cell::new(5, 0, 2);
        assert_eq!(step(from, Direction::Down, DIMS), Some(Cell::new(1, 7, 2)));
    }

    #[test]
    fn test_col_wraps_into_adjacent_zone() {
        assert_eq!(
            step(Cell::new(2, 4, 7), Direction::Left, DIMS),
            Some(Cell::new(3, 4, 0))
        );
        assert_eq!(
            step(Cell::new(2, 4, 0), Direction::Right, DIMS),
            Some(Cell::new(1, 4, 7))
        );
    }

    #[test]
    fn test_negative_zone_is_off_grid() {
        assert_eq!(step(Cell::origin(0), Direction::Down, DIMS), None);
        assert_eq!(step(Cell::origin(0), Direction::Right, DIMS), None);
        assert_eq!(step(Cell::new(3, 0, 5), Direction::Down, DIMS), None);
    }

    #[test]
    fn test_step_is_deterministic() {
        for direction in Direction::ALL {
            for zone in 0..8 {
                let from = Cell::new(zone, 7, 0);
                assert_eq!(step(from, direction, DIMS), step(from, direction, DIMS));
            }
        }
    }

    #[test]
    fn test_direction_parsing() {
        assert_eq!("UP".parse::<Direction>(), Ok(Direction::Up));
        assert_eq!(" left ".parse::<Direction>(), Ok(Direction::Left));
        assert!("north".parse::<Direction>().is_err());
        for direction in Direction::ALL {
            assert_eq!(direction.to_string().parse::<Direction>(), Ok(direction));
        }
    }

    #[test]
    fn test_contains() {
        assert!(DIMS.contains(Cell::new(9, 7, 7)));
        assert!(!DIMS.contains(Cell::new(0, 8, 0)));
    }
}
