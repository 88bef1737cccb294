use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Zero-based index into the ordered page images of a document.
pub type PageIndex = usize;

/// Upper bound of the normalized coordinate space used by bounding boxes.
pub const BOX_SCALE: u16 = 1000;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GeometryError {
    #[error("expected 4 box coordinates, got {0}")]
    WrongArity(usize),
    #[error("box coordinate {0} is not a finite number")]
    NotFinite(f64),
    #[error("box coordinate {0} is outside 0..=1000")]
    OutOfRange(f64),
    #[error("box is empty or inverted: ymin={ymin} xmin={xmin} ymax={ymax} xmax={xmax}")]
    Degenerate {
        ymin: u16,
        xmin: u16,
        ymax: u16,
        xmax: u16,
    },
}

/// Bubble region on a 0–1000 scale relative to the page's natural size.
///
/// Always satisfies `ymin < ymax` and `xmin < xmax`; the only way to build one
/// is through [`BoundingBox::new`] or [`BoundingBox::from_box_2d`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "[u16; 4]", into = "[u16; 4]")]
pub struct BoundingBox {
    ymin: u16,
    xmin: u16,
    ymax: u16,
    xmax: u16,
}

impl BoundingBox {
    pub fn new(ymin: u16, xmin: u16, ymax: u16, xmax: u16) -> Result<Self, GeometryError> {
        if ymax > BOX_SCALE || xmax > BOX_SCALE {
            return Err(GeometryError::OutOfRange(f64::from(ymax.max(xmax))));
        }
        if ymin >= ymax || xmin >= xmax {
            return Err(GeometryError::Degenerate {
                ymin,
                xmin,
                ymax,
                xmax,
            });
        }
        Ok(Self {
            ymin,
            xmin,
            ymax,
            xmax,
        })
    }

    /// Build from the `[ymin, xmin, ymax, xmax]` array the analysis service
    /// returns. Fractional values are rounded to the nearest integer.
    pub fn from_box_2d(coords: &[f64]) -> Result<Self, GeometryError> {
        let [ymin, xmin, ymax, xmax] = coords else {
            return Err(GeometryError::WrongArity(coords.len()));
        };
        Self::new(
            scale_coord(*ymin)?,
            scale_coord(*xmin)?,
            scale_coord(*ymax)?,
            scale_coord(*xmax)?,
        )
    }

    pub fn ymin(&self) -> u16 {
        self.ymin
    }

    pub fn xmin(&self) -> u16 {
        self.xmin
    }

    pub fn ymax(&self) -> u16 {
        self.ymax
    }

    pub fn xmax(&self) -> u16 {
        self.xmax
    }

    /// Map onto an image of the given natural size for overlay drawing.
    pub fn to_pixels(&self, width: u32, height: u32) -> PixelRect {
        let scale = f64::from(BOX_SCALE);
        let px = |v: u16, extent: u32| ((f64::from(v) / scale) * f64::from(extent)).round() as u32;
        let left = px(self.xmin, width);
        let top = px(self.ymin, height);
        PixelRect {
            left,
            top,
            width: px(self.xmax, width).saturating_sub(left),
            height: px(self.ymax, height).saturating_sub(top),
        }
    }
}

impl TryFrom<[u16; 4]> for BoundingBox {
    type Error = GeometryError;

    fn try_from([ymin, xmin, ymax, xmax]: [u16; 4]) -> Result<Self, Self::Error> {
        Self::new(ymin, xmin, ymax, xmax)
    }
}

impl From<BoundingBox> for [u16; 4] {
    fn from(value: BoundingBox) -> Self {
        [value.ymin, value.xmin, value.ymax, value.xmax]
    }
}

fn scale_coord(value: f64) -> Result<u16, GeometryError> {
    if !value.is_finite() {
        return Err(GeometryError::NotFinite(value));
    }
    let rounded = value.round();
    if !(0.0..=f64::from(BOX_SCALE)).contains(&rounded) {
        return Err(GeometryError::OutOfRange(value));
    }
    Ok(rounded as u16)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PixelRect {
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

/// One detected dialogue region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bubble {
    pub text: String,
    #[serde(rename = "box")]
    pub bbox: BoundingBox,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PageStatus {
    #[default]
    Pending,
    Loading,
    Complete,
    Error,
}

impl std::fmt::Display for PageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            PageStatus::Pending => "pending",
            PageStatus::Loading => "loading",
            PageStatus::Complete => "complete",
            PageStatus::Error => "error",
        };
        write!(f, "{}", label)
    }
}

/// Analysis state of a single page. `bubbles` is empty unless the page is
/// complete, and is already in reading order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageAnalysisEntry {
    pub status: PageStatus,
    pub bubbles: Vec<Bubble>,
}

impl PageAnalysisEntry {
    pub fn loading() -> Self {
        Self {
            status: PageStatus::Loading,
            bubbles: Vec::new(),
        }
    }

    pub fn complete(bubbles: Vec<Bubble>) -> Self {
        Self {
            status: PageStatus::Complete,
            bubbles,
        }
    }

    pub fn error() -> Self {
        Self {
            status: PageStatus::Error,
            bubbles: Vec::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status == PageStatus::Complete
    }
}
