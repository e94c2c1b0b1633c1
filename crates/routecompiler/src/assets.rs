//! Scenery objects and the services that load them.
//!
//! The compiler never parses mesh files or decodes images itself.
//! It asks an [Assets] implementation to load objects, register textures and
//!     register sound buffers, and only ever looks at the parts of the result
//!     it needs to place scenery: vertex positions and material textures.

use crate::output::Color24;
use geometry::Vector3;
use routelang::source::InMemorySources;
use routelang::{LoadError, SourceLoader};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Handle to a texture registered with [RegisterTexture].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TextureHandle(pub usize);

/// Handle to a sound buffer registered with [RegisterSoundBuffer].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SoundHandle(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TextureOptions {
    /// Pixels of this color are fully transparent.
    pub transparent_color: Option<Color24>,
    /// Whether texture coordinates outside of [0,1] repeat the texture.
    pub repeat: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Material {
    pub daytime_texture: Option<TextureHandle>,
    pub nighttime_texture: Option<TextureHandle>,
}

/// A mesh that does not change over time.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StaticObject {
    pub vertices: Vec<Vector3>,
    pub materials: Vec<Material>,
}

impl StaticObject {
    /// Returns the object reflected in the plane `x = 0`.
    pub fn mirrored(&self) -> StaticObject {
        let mut object = self.clone();
        for v in &mut object.vertices {
            v.x = -v.x;
        }
        object
    }

    /// Stretches a form, roof or crack object between two lateral distances.
    ///
    /// These objects are authored as a quad (or a pair of quads) spanning from the
    ///     primary rail to a neighbouring rail.
    /// The inner vertices keep their offset from the rail they belong to while
    ///     the outer vertices are moved so that the object reaches `near` at the
    ///     start of the block and `far` at its end.
    /// The upper quad of an eight vertex object uses `near` at both ends,
    ///     which is how existing routes expect roofs to be stretched.
    pub fn stretched(&self, near: f64, far: f64) -> StaticObject {
        let mut object = self.clone();
        let x = |i: usize| self.vertices.get(i).map(|v| v.x).unwrap_or(0.0);
        let n = self.vertices.len().min(8);
        if n < 4 {
            return object;
        }
        let (x2, x3, x6, x7) = (x(2), x(3), x(6), x(7));
        object.vertices[0].x = near - x3;
        object.vertices[1].x = far - x2;
        if n >= 8 {
            object.vertices[4].x = near - x7;
            object.vertices[5].x = near - x6;
        }
        object
    }

    /// Returns a copy of the object whose materials all use the given daytime texture.
    pub fn with_texture(&self, texture: TextureHandle) -> StaticObject {
        let mut object = self.clone();
        for material in &mut object.materials {
            material.daytime_texture = Some(texture);
        }
        object
    }

    /// Appends the vertices and materials of another object.
    pub fn join(&mut self, other: StaticObject) {
        self.vertices.extend(other.vertices);
        self.materials.extend(other.materials);
    }
}

/// An object whose visible state is chosen at run time.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AnimatedObject {
    pub states: Vec<StaticObject>,
    /// Function selecting the state, in postfix notation.
    ///
    /// For example `section 0 <= 0 1 ?` shows state 0 while the section aspect is at
    ///     most 0, and state 1 otherwise.
    pub state_function: Option<String>,
    /// Seconds between evaluations of the state function.
    pub refresh_rate: f64,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum UnifiedObject {
    Static(StaticObject),
    Animated(Vec<AnimatedObject>),
}

impl UnifiedObject {
    pub fn as_static(&self) -> Option<&StaticObject> {
        match self {
            UnifiedObject::Static(s) => Some(s),
            UnifiedObject::Animated(_) => None,
        }
    }

    /// Returns the object reflected in the plane `x = 0`.
    pub fn mirrored(&self) -> UnifiedObject {
        match self {
            UnifiedObject::Static(s) => UnifiedObject::Static(s.mirrored()),
            UnifiedObject::Animated(objects) => UnifiedObject::Animated(
                objects
                    .iter()
                    .map(|o| AnimatedObject {
                        states: o.states.iter().map(StaticObject::mirrored).collect(),
                        ..o.clone()
                    })
                    .collect(),
            ),
        }
    }
}

pub trait LoadObject {
    /// Loads a static or animated object.
    fn load_object(&mut self, path: &Path) -> Result<UnifiedObject, LoadError>;

    /// Loads an object that must be static.
    fn load_static_object(&mut self, path: &Path) -> Result<StaticObject, LoadError>;
}

pub trait RegisterTexture {
    fn register_texture(&mut self, path: &Path, options: TextureOptions) -> Result<TextureHandle, LoadError>;
}

pub trait RegisterSoundBuffer {
    /// Registers a sound that is audible up to the given radius in meters.
    fn register_sound_buffer(&mut self, path: &Path, radius: f64) -> Result<SoundHandle, LoadError>;
}

/// Every external service the compiler needs.
///
/// [SourceLoader] is used both to read included route files and to check that
///     referenced objects, textures and sounds exist.
pub trait Assets: SourceLoader + LoadObject + RegisterTexture + RegisterSoundBuffer {}

impl<T: SourceLoader + LoadObject + RegisterTexture + RegisterSoundBuffer> Assets for T {}

/// Returns the quad used for objects that are not given explicitly.
///
/// The quad spans one block of 25 meters and is 1 meter wide,
///     which is enough for the form and crack transformations to act on.
pub fn placeholder_object() -> StaticObject {
    let vertices = vec![
        Vector3::new(0.0, 0.0, 0.0),
        Vector3::new(0.0, 0.0, 25.0),
        Vector3::new(1.0, 0.0, 25.0),
        Vector3::new(1.0, 0.0, 0.0),
        Vector3::new(0.0, 1.0, 0.0),
        Vector3::new(0.0, 1.0, 25.0),
        Vector3::new(1.0, 1.0, 25.0),
        Vector3::new(1.0, 1.0, 0.0),
    ];
    StaticObject {
        vertices,
        materials: vec![Material::default(); 3],
    }
}

/// In-memory assets for tests and tools.
///
/// Every object path loads as [placeholder_object] unless an object was
///     inserted for it explicitly.
/// Only paths that were inserted exist, so references to other files are
///     reported as missing.
#[derive(Debug, Default, Clone)]
pub struct MemoryAssets {
    sources: InMemorySources,
    objects: HashMap<PathBuf, UnifiedObject>,
    pub textures: Vec<(PathBuf, TextureOptions)>,
    pub sounds: Vec<(PathBuf, f64)>,
}

impl MemoryAssets {
    pub fn new() -> Self {
        Default::default()
    }

    /// Adds a file with the given contents.
    pub fn insert_file(&mut self, path: impl Into<PathBuf>, contents: impl Into<String>) {
        self.sources.insert(path, contents);
    }

    /// Adds an object file that loads as the given object.
    pub fn insert_object(&mut self, path: impl Into<PathBuf>, object: UnifiedObject) {
        let path = path.into();
        self.sources.insert(path.clone(), "");
        self.objects.insert(path, object);
    }
}

impl SourceLoader for MemoryAssets {
    fn read(&self, path: &Path) -> Result<String, LoadError> {
        self.sources.read(path)
    }

    fn exists(&self, path: &Path) -> bool {
        self.sources.exists(path)
    }
}

impl LoadObject for MemoryAssets {
    fn load_object(&mut self, path: &Path) -> Result<UnifiedObject, LoadError> {
        Ok(self
            .objects
            .get(path)
            .cloned()
            .unwrap_or_else(|| UnifiedObject::Static(placeholder_object())))
    }

    fn load_static_object(&mut self, path: &Path) -> Result<StaticObject, LoadError> {
        match self.load_object(path)? {
            UnifiedObject::Static(s) => Ok(s),
            UnifiedObject::Animated(_) => Err(LoadError::Invalid(format![
                "{} is an animated object",
                path.display()
            ])),
        }
    }
}

impl RegisterTexture for MemoryAssets {
    fn register_texture(&mut self, path: &Path, options: TextureOptions) -> Result<TextureHandle, LoadError> {
        self.textures.push((path.into(), options));
        Ok(TextureHandle(self.textures.len() - 1))
    }
}

impl RegisterSoundBuffer for MemoryAssets {
    fn register_sound_buffer(&mut self, path: &Path, radius: f64) -> Result<SoundHandle, LoadError> {
        self.sounds.push((path.into(), radius));
        Ok(SoundHandle(self.sounds.len() - 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stretched_moves_outer_vertices() {
        let object = placeholder_object();
        let stretched = object.stretched(-3.8, -4.0);
        assert_eq!(stretched.vertices[0].x, -3.8 - 1.0);
        assert_eq!(stretched.vertices[1].x, -4.0 - 1.0);
        assert_eq!(stretched.vertices[4].x, -3.8 - 1.0);
        assert_eq!(stretched.vertices[5].x, -3.8 - 1.0);
        assert_eq!(stretched.vertices[2], object.vertices[2]);
    }

    #[test]
    fn stretched_ignores_small_objects() {
        let object = StaticObject {
            vertices: vec![Vector3::ZERO; 3],
            materials: vec![],
        };
        assert_eq!(object.stretched(1.0, 2.0), object);
    }

    #[test]
    fn mirrored_negates_x() {
        let object = placeholder_object().mirrored();
        assert_eq!(object.vertices[2].x, -1.0);
        assert_eq!(object.vertices[2].z, 25.0);
    }

    #[test]
    fn memory_assets_records_registrations() {
        let mut assets = MemoryAssets::new();
        assets.insert_file("/r/a.png", "");
        let h = assets
            .register_texture(Path::new("/r/a.png"), TextureOptions::default())
            .unwrap();
        assert_eq!(h, TextureHandle(0));
        assert!(assets.exists(Path::new("/r/a.png")));
        assert!(!assets.exists(Path::new("/r/b.png")));
        assert_eq!(assets.textures.len(), 1);
    }
}
