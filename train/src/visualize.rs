//! Box records of evaluation predictions for experiment dashboards.

use crate::{common::*, postprocess::Detection};

/// Boxes scoring below this are not visualized by default.
pub const DEFAULT_SCORE_THRESHOLD: f64 = 0.10;

/// The class index reserved for "no object".
pub const BACKGROUND_CLASS: i64 = 0;

/// One predicted box on the host.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredBox {
    /// xyxy in pixels of the original image.
    pub xyxy: [f64; 4],
    pub label: i64,
    pub score: f64,
}

/// Copies the boxes, labels and scores of a detection to the host.
pub fn scored_boxes(detection: &Detection) -> Result<Vec<ScoredBox>> {
    let Detection {
        boxes,
        labels,
        scores,
        ..
    } = detection;
    let to_host = |tensor: &Tensor, kind: Kind| {
        tensor.to_device(Device::Cpu).to_kind(kind).view([-1])
    };
    let boxes = Vec::<f64>::from(&to_host(boxes, Kind::Double));
    let labels = Vec::<i64>::from(&to_host(labels, Kind::Int64));
    let scores = Vec::<f64>::from(&to_host(scores, Kind::Double));

    ensure!(
        boxes.len() == labels.len() * 4 && scores.len() == labels.len(),
        "inconsistent detection sizes: {} box values, {} labels, {} scores",
        boxes.len(),
        labels.len(),
        scores.len()
    );

    let output = izip!(boxes.chunks_exact(4), labels, scores)
        .map(|(xyxy, label, score)| ScoredBox {
            xyxy: [xyxy[0], xyxy[1], xyxy[2], xyxy[3]],
            label,
            score,
        })
        .collect();
    Ok(output)
}

/// Drops background boxes and boxes scoring below `threshold`.
pub fn filter_predictions<I>(boxes: I, threshold: f64) -> Vec<ScoredBox>
where
    I: IntoIterator<Item = ScoredBox>,
{
    boxes
        .into_iter()
        .filter(|scored| scored.label != BACKGROUND_CLASS && scored.score >= threshold)
        .collect()
}

/// Rounds a score to three decimals.
pub fn round_score(score: f64) -> f64 {
    (score * 1000.0).round() / 1000.0
}

/// Box corners as fractions of the image size.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoxPosition {
    #[serde(rename = "xmin")]
    pub min_x: f64,
    #[serde(rename = "xmax")]
    pub max_x: f64,
    #[serde(rename = "ymin")]
    pub min_y: f64,
    #[serde(rename = "ymax")]
    pub max_y: f64,
}

impl BoxPosition {
    pub fn from_xyxy(xyxy: [f64; 4], width: f64, height: f64) -> Self {
        let [x0, y0, x1, y1] = xyxy;
        Self {
            min_x: x0 / width,
            max_x: x1 / width,
            min_y: y0 / height,
            max_y: y1 / height,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoxRecord {
    pub position: BoxPosition,
    pub class_id: i64,
    pub score: f64,
    pub box_caption: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoxGroup {
    pub box_data: Vec<BoxRecord>,
}

/// The box annotations of one image, in the layout of experiment
/// dashboards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImagePredictions {
    pub predictions: BoxGroup,
}

impl ImagePredictions {
    pub fn boxes(&self) -> &[BoxRecord] {
        &self.predictions.box_data
    }
}

/// Resolves image files and category names of a dataset.
pub trait ImageCatalog {
    fn image_path(&self, image_id: i64) -> Result<PathBuf>;

    fn category_name(&self, category_id: i64) -> Result<String>;
}

/// Builds the records of the boxes kept by [filter_predictions].
///
/// `image_size` is the width and height of the image file.
pub fn box_records(
    boxes: &[ScoredBox],
    image_size: (usize, usize),
    catalog: &dyn ImageCatalog,
) -> Result<ImagePredictions> {
    let (width, height) = image_size;
    ensure!(
        width > 0 && height > 0,
        "invalid image size {}x{}",
        width,
        height
    );

    let box_data: Vec<_> = boxes
        .iter()
        .map(|scored| -> Result<_> {
            let ScoredBox { xyxy, label, score } = *scored;
            let score = round_score(score);
            let name = catalog.category_name(label)?;

            Ok(BoxRecord {
                position: BoxPosition::from_xyxy(xyxy, width as f64, height as f64),
                class_id: label,
                score,
                box_caption: format!("score: {:?}, class: {}", score, name),
            })
        })
        .collect::<Result<_>>()?;

    Ok(ImagePredictions {
        predictions: BoxGroup { box_data },
    })
}

/// Reads the width and height of an image from its file header.
pub fn image_dimensions(path: &Path) -> Result<(usize, usize)> {
    let size = imagesize::size(path)
        .map_err(|err| format_err!("failed to read size of '{}': {:?}", path.display(), err))?;
    Ok((size.width, size.height))
}

mod coco_catalog {
    use super::*;

    #[derive(Debug, Deserialize)]
    struct Annotations {
        images: Vec<ImageEntry>,
        categories: Vec<CategoryEntry>,
    }

    #[derive(Debug, Deserialize)]
    struct ImageEntry {
        id: i64,
        file_name: String,
    }

    #[derive(Debug, Deserialize)]
    struct CategoryEntry {
        id: i64,
        name: String,
    }

    /// The images and categories of a COCO annotation file.
    #[derive(Debug, Clone)]
    pub struct CocoCatalog {
        image_dir: PathBuf,
        images: HashMap<i64, String>,
        categories: HashMap<i64, String>,
    }

    impl CocoCatalog {
        /// Loads the annotation file. Image file names are resolved against
        /// `image_dir`.
        pub fn open(
            annotation_file: impl AsRef<Path>,
            image_dir: impl Into<PathBuf>,
        ) -> Result<Self> {
            let annotation_file = annotation_file.as_ref();
            let text = fs::read_to_string(annotation_file)
                .with_context(|| format!("failed to read '{}'", annotation_file.display()))?;
            Self::from_json(&text, image_dir)
        }

        pub fn from_json(text: &str, image_dir: impl Into<PathBuf>) -> Result<Self> {
            let Annotations { images, categories } = serde_json::from_str(text)?;

            let images = images
                .into_iter()
                .map(|ImageEntry { id, file_name }| (id, file_name))
                .collect();
            let categories = categories
                .into_iter()
                .map(|CategoryEntry { id, name }| (id, name))
                .collect();

            Ok(Self {
                image_dir: image_dir.into(),
                images,
                categories,
            })
        }
    }

    impl ImageCatalog for CocoCatalog {
        fn image_path(&self, image_id: i64) -> Result<PathBuf> {
            let file_name = self
                .images
                .get(&image_id)
                .ok_or_else(|| format_err!("image {} is not in the catalog", image_id))?;
            Ok(self.image_dir.join(file_name))
        }

        fn category_name(&self, category_id: i64) -> Result<String> {
            self.categories
                .get(&category_id)
                .cloned()
                .ok_or_else(|| format_err!("category {} is not in the catalog", category_id))
        }
    }
}
pub use coco_catalog::*;

mod drawing {
    use super::*;

    /// Fills `[top, bottom) × [left, right)` of a `[C, H, W]` image with `color`.
    fn fill_rect_(
        image: &mut Tensor,
        top: i64,
        left: i64,
        bottom: i64,
        right: i64,
        color: &Tensor,
    ) {
        if bottom <= top || right <= left {
            return;
        }
        let n_channels = image.size()[0];
        let mut rect = image
            .narrow(1, top, bottom - top)
            .narrow(2, left, right - left);
        let expanded = color.view([n_channels, 1, 1]).expand_as(&rect);
        rect.copy_(&expanded);
    }

    /// Draws the outline of every box onto a copy of a `[C, H, W]` image.
    ///
    /// Box positions are fractions of the image size. `color` has one value
    /// per channel in the value range of the image.
    pub fn draw_predictions(
        image: &Tensor,
        predictions: &ImagePredictions,
        stroke: i64,
        color: &Tensor,
    ) -> Result<Tensor> {
        let (n_channels, height, width) = match image.size().as_slice() {
            &[c, h, w] => (c, h, w),
            shape => bail!("invalid shape {:?}: expect three dimensions", shape),
        };
        ensure!(
            color.size() == [n_channels],
            "the number of channels does not match"
        );
        ensure!(stroke > 0, "stroke must be positive");

        tch::no_grad(|| {
            let mut canvas = image.copy();
            let color = color.to_kind(canvas.kind()).to_device(canvas.device());

            for record in predictions.boxes() {
                let BoxPosition {
                    min_x,
                    max_x,
                    min_y,
                    max_y,
                } = record.position;
                let to_pixel =
                    |ratio: f64, size: i64| ((ratio * size as f64) as i64).max(0).min(size - 1);
                let t = to_pixel(min_y, height);
                let b = to_pixel(max_y, height) + 1;
                let l = to_pixel(min_x, width);
                let r = to_pixel(max_x, width) + 1;

                let inner_t = (t + stroke).min(b);
                let inner_b = (b - stroke).max(t);
                let inner_l = (l + stroke).min(r);
                let inner_r = (r - stroke).max(l);

                // top, bottom, left and right edges
                fill_rect_(&mut canvas, t, l, inner_t, r, &color);
                fill_rect_(&mut canvas, inner_b, l, b, r, &color);
                fill_rect_(&mut canvas, t, l, b, inner_l, &color);
                fill_rect_(&mut canvas, t, inner_r, b, r, &color);
            }

            Ok(canvas)
        })
    }
}
pub use drawing::*;
