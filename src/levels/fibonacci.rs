use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Fibonacci ratios applied to the ATR, outermost first.
pub const FIB_RATIOS: [f64; 7] = [1.0, 0.786, 0.618, 0.5, 0.382, 0.236, 0.0];

#[derive(Debug, Clone, PartialEq)]
pub struct Level {
    pub name: String,
    pub value: f64,
}

/// Named price levels, kept in construction order.
///
/// Serialized as a JSON object (`{"Level_+1.0": 512.3, ...}`) preserving that
/// order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LevelSet {
    levels: Vec<Level>,
}

impl LevelSet {
    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Level> {
        self.levels.iter()
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.iter().find(|l| l.name == name).map(|l| l.value)
    }

    /// Levels from highest to lowest price.
    pub fn sorted_desc(&self) -> Vec<&Level> {
        let mut sorted: Vec<&Level> = self.iter().collect();
        sorted.sort_by(|a, b| b.value.total_cmp(&a.value));
        sorted
    }

    fn push(&mut self, name: String, value: f64) {
        self.levels.push(Level { name, value });
    }
}

fn format_ratio(ratio: f64) -> String {
    if ratio.fract() == 0.0 {
        format!("{:.1}", ratio)
    } else {
        format!("{}", ratio)
    }
}

/// Builds the levels around the prior 4H close.
///
/// Each non-zero ratio `r` gives `Level_+r = close + atr * r` and
/// `Level_-r = close - atr * r`; ratio zero gives `Level_0 = close`.
pub fn calculate_levels(prior_close: f64, atr: f64) -> LevelSet {
    let mut levels = LevelSet::default();

    for ratio in FIB_RATIOS {
        if ratio == 0.0 {
            levels.push("Level_0".to_string(), prior_close);
        } else {
            let label = format_ratio(ratio);
            levels.push(format!("Level_+{}", label), prior_close + atr * ratio);
            levels.push(format!("Level_-{}", label), prior_close - atr * ratio);
        }
    }

    levels
}

impl Serialize for LevelSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.len()))?;
        for level in self.iter() {
            map.serialize_entry(&level.name, &level.value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for LevelSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct LevelSetVisitor;

        impl<'de> Visitor<'de> for LevelSetVisitor {
            type Value = LevelSet;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of level names to prices")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<LevelSet, A::Error> {
                let mut levels = LevelSet::default();
                while let Some((name, value)) = access.next_entry::<String, f64>()? {
                    levels.push(name, value);
                }
                Ok(levels)
            }
        }

        deserializer.deserialize_map(LevelSetVisitor)
    }
}
