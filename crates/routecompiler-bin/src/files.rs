//! Assets read from the local file system.

use routecompiler::assets::{
    placeholder_object, LoadObject, RegisterSoundBuffer, RegisterTexture, SoundHandle, StaticObject,
    TextureHandle, TextureOptions, UnifiedObject,
};
use routelang::source::FileSystem;
use routelang::{LoadError, SourceLoader};
use std::path::{Path, PathBuf};

/// Assets backed by the file system.
///
/// Mesh files are not parsed.
/// Every object file that exists loads as the placeholder quad,
///     which is enough to check a route and to see where its scenery goes.
#[derive(Debug, Default)]
pub struct FileAssets {
    pub textures: Vec<PathBuf>,
    pub sounds: Vec<PathBuf>,
}

fn require(path: &Path) -> Result<(), LoadError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(LoadError::NotFound(path.into()))
    }
}

impl SourceLoader for FileAssets {
    fn read(&self, path: &Path) -> Result<String, LoadError> {
        FileSystem.read(path)
    }

    fn exists(&self, path: &Path) -> bool {
        FileSystem.exists(path)
    }
}

impl LoadObject for FileAssets {
    fn load_object(&mut self, path: &Path) -> Result<UnifiedObject, LoadError> {
        Ok(UnifiedObject::Static(self.load_static_object(path)?))
    }

    fn load_static_object(&mut self, path: &Path) -> Result<StaticObject, LoadError> {
        require(path)?;
        Ok(placeholder_object())
    }
}

impl RegisterTexture for FileAssets {
    fn register_texture(&mut self, path: &Path, _: TextureOptions) -> Result<TextureHandle, LoadError> {
        require(path)?;
        self.textures.push(path.into());
        Ok(TextureHandle(self.textures.len() - 1))
    }
}

impl RegisterSoundBuffer for FileAssets {
    fn register_sound_buffer(&mut self, path: &Path, _: f64) -> Result<SoundHandle, LoadError> {
        require(path)?;
        self.sounds.push(path.into());
        Ok(SoundHandle(self.sounds.len() - 1))
    }
}
