use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use log::info;
use printpdf::{ColorBits, ColorSpace, Image, ImageTransform, ImageXObject, Mm, PdfDocument, Px};

use crate::error::EnsembleError;

/// One rendered page: packed 8-bit RGB, row major.
#[derive(Debug, Clone)]
pub struct Page {
    pub width: u32,
    pub height: u32,
    pub rgb: Vec<u8>,
}

impl Page {
    pub fn blank(width: u32, height: u32) -> Self {
        Page {
            width,
            height,
            rgb: vec![255; width as usize * height as usize * 3],
        }
    }
}

fn px_to_mm(px: u32, dpi: f32) -> Mm {
    Mm(px as f32 / dpi * 25.4)
}

/// Collects raster pages and writes them as one PDF, each page sized to its image.
pub struct PdfPages {
    title: String,
    dpi: f32,
    pages: Vec<Page>,
}

impl PdfPages {
    pub fn new(title: impl Into<String>, dpi: f32) -> Self {
        PdfPages {
            title: title.into(),
            dpi,
            pages: Vec::new(),
        }
    }

    pub fn push(&mut self, page: Page) {
        self.pages.push(page);
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn save(self, path: &Path) -> Result<(), EnsembleError> {
        let mut pages = self.pages.into_iter();
        let first = pages
            .next()
            .ok_or_else(|| EnsembleError::Pdf("no pages to write".to_string()))?;

        let (doc, page1, layer1) = PdfDocument::new(
            self.title.as_str(),
            px_to_mm(first.width, self.dpi),
            px_to_mm(first.height, self.dpi),
            "Layer 1",
        );
        place_image(doc.get_page(page1).get_layer(layer1), first, self.dpi)?;

        let mut count = 1;
        for page in pages {
            let (p, l) = doc.add_page(
                px_to_mm(page.width, self.dpi),
                px_to_mm(page.height, self.dpi),
                "Layer 1",
            );
            place_image(doc.get_page(p).get_layer(l), page, self.dpi)?;
            count += 1;
        }

        let mut writer = BufWriter::new(File::create(path)?);
        doc.save(&mut writer)
            .map_err(|e| EnsembleError::Pdf(e.to_string()))?;
        info!("{} pages written to {}", count, path.display());
        Ok(())
    }
}

fn place_image(layer: printpdf::PdfLayerReference, page: Page, dpi: f32) -> Result<(), EnsembleError> {
    let expected = page.width as usize * page.height as usize * 3;
    if page.rgb.len() != expected {
        return Err(EnsembleError::Pdf(format!(
            "page buffer holds {} bytes, expected {} for {}x{}",
            page.rgb.len(),
            expected,
            page.width,
            page.height
        )));
    }
    let image = Image::from(ImageXObject {
        width: Px(page.width as usize),
        height: Px(page.height as usize),
        color_space: ColorSpace::Rgb,
        bits_per_component: ColorBits::Bit8,
        interpolate: true,
        image_data: page.rgb,
        image_filter: None,
        smask: None,
        clipping_bbox: None,
    });
    image.add_to_layer(
        layer,
        ImageTransform {
            dpi: Some(dpi),
            ..Default::default()
        },
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn pages_are_written_to_one_document() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pages.pdf");
        let mut pdf = PdfPages::new("test", 72.0);
        pdf.push(Page::blank(40, 30));
        pdf.push(Page::blank(40, 30));
        assert_eq!(pdf.len(), 2);
        pdf.save(&path).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert!(bytes.starts_with(b"%PDF"));
    }

    #[test]
    fn empty_document_is_an_error() {
        let dir = tempdir().unwrap();
        let pdf = PdfPages::new("empty", 72.0);
        assert!(pdf.is_empty());
        assert!(pdf.save(&dir.path().join("e.pdf")).is_err());
    }

    #[test]
    fn short_buffer_is_rejected() {
        let dir = tempdir().unwrap();
        let mut pdf = PdfPages::new("bad", 72.0);
        pdf.push(Page {
            width: 10,
            height: 10,
            rgb: vec![0; 10],
        });
        assert!(matches!(pdf.save(&dir.path().join("b.pdf")), Err(EnsembleError::Pdf(_))));
    }
}
