use ai::{AIModel, ImageCaptionInput, ImageCaptionModel, Model};
use image::{DynamicImage, GenericImageView, ImageFormat};
use std::{fs, io::Write, path::Path};
use zip::write::SimpleFileOptions;

/// Captions an image with its size and token budget.
pub struct FakeCaptionModel;

impl Model for FakeCaptionModel {
    type Item = ImageCaptionInput;
    type Output = String;

    fn batch_size_limit(&self) -> usize {
        1
    }

    async fn process(
        &mut self,
        items: Vec<Self::Item>,
    ) -> anyhow::Result<Vec<anyhow::Result<Self::Output>>> {
        Ok(items
            .into_iter()
            .map(|item| {
                if item.prompt == "fail" {
                    anyhow::bail!("out of memory");
                }
                let (width, height) = item.image.dimensions();
                Ok(format!("{}x{} {}", width, height, item.max_new_tokens))
            })
            .collect())
    }
}

pub async fn fake_engine() -> ImageCaptionModel {
    AIModel::new("fake-caption", || async { Ok(FakeCaptionModel) })
        .await
        .unwrap()
}

pub fn encode_image(width: u32, height: u32, format: ImageFormat) -> Vec<u8> {
    let mut bytes = vec![];
    DynamicImage::new_rgb8(width, height)
        .write_to(&mut std::io::Cursor::new(&mut bytes), format)
        .unwrap();
    bytes
}

pub fn write_zip(path: &Path, entries: &[(&str, Vec<u8>)]) {
    let mut zip = zip::ZipWriter::new(fs::File::create(path).unwrap());
    for (name, content) in entries {
        zip.start_file(*name, SimpleFileOptions::default()).unwrap();
        zip.write_all(content).unwrap();
    }
    zip.finish().unwrap();
}

/// (name, content) of every entry, sorted by name
pub fn read_zip(path: &Path) -> Vec<(String, String)> {
    let mut archive = zip::ZipArchive::new(fs::File::open(path).unwrap()).unwrap();
    let mut entries = vec![];
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).unwrap();
        let mut content = String::new();
        std::io::Read::read_to_string(&mut entry, &mut content).unwrap();
        entries.push((entry.name().to_string(), content));
    }
    entries.sort();
    entries
}
