//! Level resolution over the static threshold table.

use crate::types::{KudosError, Level, Result};

/// Ordered, contiguous level table.
///
/// Construction validates that bands start at the lowest level, never
/// overlap, leave no gaps, and that only the last band is open-ended, so
/// [`LevelTable::resolve`] is total over every point value.
#[derive(Debug, Clone)]
pub struct LevelTable {
    levels: Vec<Level>,
}

impl LevelTable {
    pub fn new(mut levels: Vec<Level>) -> Result<Self> {
        if levels.is_empty() {
            return Err(KudosError::Configuration(
                "level table must contain at least one level".to_string(),
            ));
        }

        levels.sort_by_key(|l| l.level);

        for pair in levels.windows(2) {
            let (lower, upper) = (&pair[0], &pair[1]);
            if upper.level == lower.level {
                return Err(KudosError::Configuration(format!(
                    "duplicate level {}",
                    lower.level
                )));
            }
            let max = lower.max_points.ok_or_else(|| {
                KudosError::Configuration(format!(
                    "level {} has no max_points but is not the top level",
                    lower.level
                ))
            })?;
            if max < lower.min_points {
                return Err(KudosError::Configuration(format!(
                    "level {} has max_points below min_points",
                    lower.level
                )));
            }
            if upper.min_points != max + 1 {
                return Err(KudosError::Configuration(format!(
                    "levels {} and {} are not contiguous ({} then {})",
                    lower.level, upper.level, max, upper.min_points
                )));
            }
        }

        if let Some(top) = levels.last() {
            if let Some(max) = top.max_points {
                if max < top.min_points {
                    return Err(KudosError::Configuration(format!(
                        "level {} has max_points below min_points",
                        top.level
                    )));
                }
            }
        }

        Ok(Self { levels })
    }

    /// Resolve the level for a cumulative point total.
    ///
    /// Totals below the first band resolve to the first level; totals above a
    /// closed top band resolve to the top level.
    pub fn resolve(&self, total_points: i64) -> &Level {
        let idx = self
            .levels
            .partition_point(|l| l.min_points <= total_points);
        &self.levels[idx.saturating_sub(1)]
    }

    /// The lowest level.
    pub fn first(&self) -> &Level {
        &self.levels[0]
    }

    /// The level above `level`, if any.
    pub fn next_after(&self, level: u32) -> Option<&Level> {
        self.levels.iter().find(|l| l.level > level)
    }

    pub fn get(&self, level: u32) -> Option<&Level> {
        self.levels.iter().find(|l| l.level == level)
    }

    pub fn levels(&self) -> &[Level] {
        &self.levels
    }
}
