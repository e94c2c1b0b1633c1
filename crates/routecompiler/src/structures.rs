//! Structure tables
//!
//! Route files refer to scenery objects, signals and textures by small integer keys.
//! The keys are defined in the `Structure`, `Signal`, `Cycle` and `Train` namespaces
//!     and stay valid for the whole compilation.

use crate::assets::{StaticObject, TextureHandle, UnifiedObject};
use crate::output::Background;
use std::collections::BTreeMap;
use std::rc::Rc;

/// A table keyed by route file indices.
#[derive(Debug, Clone, PartialEq)]
pub struct Table<T>(BTreeMap<i32, T>);

impl<T> Default for Table<T> {
    fn default() -> Self {
        Table(BTreeMap::new())
    }
}

impl<T> Table<T> {
    pub fn get(&self, key: i32) -> Option<&T> {
        self.0.get(&key)
    }

    pub fn get_mut(&mut self, key: i32) -> Option<&mut T> {
        self.0.get_mut(&key)
    }

    pub fn contains(&self, key: i32) -> bool {
        self.0.contains_key(&key)
    }

    /// Sets the value for a key.
    ///
    /// Returns true if a previous value was replaced.
    pub fn define(&mut self, key: i32, value: T) -> bool {
        self.0.insert(key, value).is_some()
    }

    pub fn entry_or_default(&mut self, key: i32) -> &mut T
    where
        T: Default,
    {
        self.0.entry(key).or_default()
    }

    pub fn entry_or_insert_with(&mut self, key: i32, default: impl FnOnce() -> T) -> &mut T {
        self.0.entry(key).or_insert_with(default)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (i32, &T)> {
        self.0.iter().map(|(k, v)| (*k, v))
    }

    pub fn into_map(self) -> BTreeMap<i32, T> {
        self.0
    }
}

/// How a signal is drawn.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalDefinition {
    /// An animated object whose state function reads the section aspect itself.
    Animated(Rc<UnifiedObject>),
    /// One static object per aspect.
    ///
    /// Object `k` is shown while the aspect is at most `numbers[k]`.
    Compatibility {
        numbers: Vec<i32>,
        objects: Vec<StaticObject>,
    },
    /// A base object and a glow object, retextured for each aspect.
    ///
    /// Aspect `k` uses `signal_textures[k]` on the base and `glow_textures[k]` on the glow.
    RawObjectPair {
        base: Option<StaticObject>,
        glow: Option<StaticObject>,
        signal_textures: Vec<Option<TextureHandle>>,
        glow_textures: Vec<Option<TextureHandle>>,
    },
}

/// Every table defined by the route file.
#[derive(Debug, Clone, Default)]
pub struct StructureTables {
    pub rail: Table<Rc<UnifiedObject>>,
    pub beacon: Table<Rc<UnifiedObject>>,
    /// Poles, keyed by the number of additional rails covered and then by type.
    pub poles: Table<Table<Rc<UnifiedObject>>>,
    pub ground: Table<Rc<UnifiedObject>>,
    pub wall_left: Table<Rc<UnifiedObject>>,
    pub wall_right: Table<Rc<UnifiedObject>>,
    pub dike_left: Table<Rc<UnifiedObject>>,
    pub dike_right: Table<Rc<UnifiedObject>>,
    pub form_left: Table<Rc<UnifiedObject>>,
    pub form_right: Table<Rc<UnifiedObject>>,
    pub form_center_left: Table<Rc<StaticObject>>,
    pub form_center_right: Table<Rc<StaticObject>>,
    pub roof_left: Table<Rc<UnifiedObject>>,
    pub roof_right: Table<Rc<UnifiedObject>>,
    pub roof_center_left: Table<Rc<StaticObject>>,
    pub roof_center_right: Table<Rc<StaticObject>>,
    pub crack_left: Table<Rc<StaticObject>>,
    pub crack_right: Table<Rc<StaticObject>>,
    pub free_objects: Table<Rc<UnifiedObject>>,
    pub signals: Table<Rc<SignalDefinition>>,
    /// Ground cycles: the ground structure used in consecutive blocks.
    pub cycles: Table<Vec<i32>>,
    /// Rail cycles: the rail structure used in consecutive blocks.
    pub rail_cycles: Table<Vec<i32>>,
    /// Run sound index for each rail structure.
    pub run_sounds: Table<i32>,
    /// Flange sound index for each rail structure.
    pub flange_sounds: Table<i32>,
    pub timetable_day: Table<TextureHandle>,
    pub timetable_night: Table<TextureHandle>,
    pub backgrounds: Table<Background>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn define_reports_replacement() {
        let mut table: Table<i32> = Default::default();
        assert!(!table.define(3, 1));
        assert!(table.define(3, 2));
        assert_eq!(table.get(3), Some(&2));
        assert!(!table.contains(4));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn nested_tables() {
        let mut poles: Table<Table<i32>> = Default::default();
        poles.entry_or_default(1).define(2, 7);
        assert_eq!(poles.get(1).and_then(|t| t.get(2)), Some(&7));
        assert_eq!(poles.get(0), None);
    }

    #[test]
    fn iteration_is_ordered() {
        let mut table: Table<&str> = Default::default();
        table.define(5, "b");
        table.define(-1, "a");
        let keys: Vec<i32> = table.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![-1, 5]);
    }
}
