use std::path::Path;

use anyhow::{Context, Result};
use image::DynamicImage;

/// What the user asked to translate.
pub enum Input {
    Text(String),
    Image(DynamicImage),
}

impl Input {
    pub fn read_text(path: &Path) -> Result<Self> {
        let bytes =
            std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        let text = String::from_utf8(bytes)
            .with_context(|| format!("{} is not valid UTF-8", path.display()))?;
        Ok(Self::Text(text))
    }

    pub fn read_image(path: &Path) -> Result<Self> {
        let image =
            image::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        Ok(Self::Image(DynamicImage::ImageRgb8(image.to_rgb8())))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Input::Text(_) => "text",
            Input::Image(_) => "image",
        }
    }
}

#[cfg(test)]
mod tests {
    use image::{GrayImage, Luma};

    use super::*;

    #[test]
    fn text_is_read_verbatim() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("input.txt");
        std::fs::write(&path, "how are you doing today?\n")?;

        let input = Input::read_text(&path)?;
        assert_eq!(input.kind(), "text");
        assert!(matches!(input, Input::Text(ref text) if text == "how are you doing today?\n"));
        Ok(())
    }

    #[test]
    fn invalid_utf8_names_the_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("latin1.txt");
        std::fs::write(&path, [0x63, 0x61, 0x66, 0xe9])?;

        let err = Input::read_text(&path).err().context("expected an error")?;
        assert!(format!("{err:#}").contains("latin1.txt"));
        Ok(())
    }

    #[test]
    fn images_are_converted_to_rgb() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("page.png");
        GrayImage::from_pixel(3, 2, Luma([200])).save(&path)?;

        let input = Input::read_image(&path)?;
        assert_eq!(input.kind(), "image");
        match input {
            Input::Image(image) => {
                let rgb = image.as_rgb8().context("expected RGB8 pixels")?;
                assert_eq!(rgb.dimensions(), (3, 2));
                assert_eq!(rgb.get_pixel(0, 0).0, [200, 200, 200]);
            }
            Input::Text(_) => anyhow::bail!("expected an image"),
        }
        Ok(())
    }

    #[test]
    fn missing_image_is_an_error() {
        assert!(Input::read_image(Path::new("does-not-exist.png")).is_err());
    }
}
