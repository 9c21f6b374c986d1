//! Grounding box output and box geometry
//!
//! [`PredictedBox`] is the host-side view of one predicted box. The tensor
//! helpers at the bottom of the module work on batches and are used by the
//! grounding loss.

use std::fmt;

use candle_core::{Result, Tensor, D};

/// One grounding result in normalised [0, 1] image coordinates
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PredictedBox {
    /// Box as [cx, cy, w, h]
    pub cxcywh: [f32; 4],
}

impl PredictedBox {
    pub fn new(cxcywh: [f32; 4]) -> Self {
        Self { cxcywh }
    }

    /// Create a box from [x1, y1, x2, y2] corners
    pub fn from_xyxy(xyxy: [f32; 4]) -> Self {
        let [x1, y1, x2, y2] = xyxy;
        Self::new([(x1 + x2) / 2.0, (y1 + y2) / 2.0, x2 - x1, y2 - y1])
    }

    /// Read a [B, 4] tensor of (cx, cy, w, h) rows
    pub fn from_tensor(boxes: &Tensor) -> Result<Vec<Self>> {
        let (_, width) = boxes.dims2()?;
        if width != 4 {
            candle_core::bail!("expected boxes of shape [B, 4], got {:?}", boxes.dims());
        }
        let rows = boxes.to_dtype(candle_core::DType::F32)?.to_vec2::<f32>()?;
        Ok(rows
            .into_iter()
            .map(|row| Self::new([row[0], row[1], row[2], row[3]]))
            .collect())
    }

    pub fn center(&self) -> (f32, f32) {
        (self.cxcywh[0], self.cxcywh[1])
    }

    pub fn width(&self) -> f32 {
        self.cxcywh[2]
    }

    pub fn height(&self) -> f32 {
        self.cxcywh[3]
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// Convert to [x1, y1, x2, y2]
    pub fn to_xyxy(&self) -> [f32; 4] {
        let [cx, cy, w, h] = self.cxcywh;
        [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0]
    }

    /// Corners in pixel space of an image of the given size
    pub fn to_pixels(&self, width: u32, height: u32) -> [f32; 4] {
        let [x1, y1, x2, y2] = self.to_xyxy();
        let (w, h) = (width as f32, height as f32);
        [x1 * w, y1 * h, x2 * w, y2 * h]
    }

    fn intersection_and_union(&self, other: &Self) -> (f32, f32) {
        let a = self.to_xyxy();
        let b = other.to_xyxy();
        let iw = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
        let ih = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
        let inter = iw * ih;
        (inter, self.area() + other.area() - inter)
    }

    /// Intersection over union
    pub fn iou(&self, other: &Self) -> f32 {
        let (inter, union) = self.intersection_and_union(other);
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }

    /// Generalized IoU: IoU minus the share of the enclosing box covered by
    /// neither box
    pub fn giou(&self, other: &Self) -> f32 {
        let (inter, union) = self.intersection_and_union(other);
        let a = self.to_xyxy();
        let b = other.to_xyxy();
        let enclosing = (a[2].max(b[2]) - a[0].min(b[0])) * (a[3].max(b[3]) - a[1].min(b[1]));
        if union <= 0.0 || enclosing <= 0.0 {
            return 0.0;
        }
        inter / union - (enclosing - union) / enclosing
    }
}

impl fmt::Display for PredictedBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Box {{ cx: {:.4}, cy: {:.4}, w: {:.4}, h: {:.4} }}",
            self.cxcywh[0], self.cxcywh[1], self.cxcywh[2], self.cxcywh[3]
        )
    }
}

/// [N, 4] (cx, cy, w, h) -> [N, 4] (x1, y1, x2, y2)
pub fn box_cxcywh_to_xyxy(boxes: &Tensor) -> Result<Tensor> {
    let center = boxes.narrow(D::Minus1, 0, 2)?;
    let half = (boxes.narrow(D::Minus1, 2, 2)? * 0.5)?;
    Tensor::cat(&[(&center - &half)?, (&center + &half)?], D::Minus1)
}

/// Generalized IoU between matching rows of two [N, 4] xyxy tensors
///
/// Returns [N].
pub fn generalized_box_iou(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let area = |x: &Tensor| -> Result<Tensor> {
        let wh = (x.narrow(D::Minus1, 2, 2)? - x.narrow(D::Minus1, 0, 2)?)?;
        wh.narrow(D::Minus1, 0, 1)?
            .mul(&wh.narrow(D::Minus1, 1, 1)?)?
            .squeeze(D::Minus1)
    };
    let a_lt = a.narrow(D::Minus1, 0, 2)?;
    let a_rb = a.narrow(D::Minus1, 2, 2)?;
    let b_lt = b.narrow(D::Minus1, 0, 2)?;
    let b_rb = b.narrow(D::Minus1, 2, 2)?;

    let inter_wh = (a_rb.minimum(&b_rb)? - a_lt.maximum(&b_lt)?)?.relu()?;
    let inter = inter_wh
        .narrow(D::Minus1, 0, 1)?
        .mul(&inter_wh.narrow(D::Minus1, 1, 1)?)?
        .squeeze(D::Minus1)?;
    let union = ((area(a)? + area(b)?)? - &inter)?;
    let iou = inter.div(&union)?;

    let enclosing_wh = (a_rb.maximum(&b_rb)? - a_lt.minimum(&b_lt)?)?.relu()?;
    let enclosing = enclosing_wh
        .narrow(D::Minus1, 0, 1)?
        .mul(&enclosing_wh.narrow(D::Minus1, 1, 1)?)?
        .squeeze(D::Minus1)?;
    iou - ((&enclosing - &union)? / &enclosing)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_from_tensor_reads_rows() {
        let device = Device::Cpu;
        let t = Tensor::new(&[[0.5f32, 0.5, 0.2, 0.4], [0.1, 0.2, 0.3, 0.4]], &device).unwrap();
        let boxes = PredictedBox::from_tensor(&t).unwrap();
        assert_eq!(boxes.len(), 2);
        assert_eq!(boxes[1].cxcywh, [0.1, 0.2, 0.3, 0.4]);
    }

    #[test]
    fn test_from_tensor_rejects_narrow_rows() {
        let device = Device::Cpu;
        let boxes = Tensor::new(&[[0.5f32, 0.5], [0.1, 0.2]], &device).unwrap();
        assert!(PredictedBox::from_tensor(&boxes).is_err());
        let flat = Tensor::new(&[0.5f32, 0.5, 0.2, 0.2], &device).unwrap();
        assert!(PredictedBox::from_tensor(&flat).is_err());
    }

    #[test]
    fn test_box_dimensions() {
        let b = PredictedBox::new([0.5, 0.5, 0.2, 0.4]);
        assert_eq!(b.center(), (0.5, 0.5));
        assert!((b.area() - 0.08).abs() < 1e-6);
    }

    #[test]
    fn test_xyxy_conversion() {
        let b = PredictedBox::from_xyxy([0.25, 0.5, 0.75, 1.0]);
        assert_eq!(b.cxcywh, [0.5, 0.75, 0.5, 0.5]);
        assert_eq!(b.to_xyxy(), [0.25, 0.5, 0.75, 1.0]);
        assert_eq!(b.to_pixels(640, 480), [160.0, 240.0, 480.0, 480.0]);
    }

    #[test]
    fn test_iou_and_giou() {
        let a = PredictedBox::from_xyxy([0.0, 0.0, 0.5, 0.5]);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
        assert!((a.giou(&a) - 1.0).abs() < 1e-6);

        // Disjoint boxes: IoU 0, GIoU negative
        let b = PredictedBox::from_xyxy([0.5, 0.5, 1.0, 1.0]);
        assert_eq!(a.iou(&b), 0.0);
        assert!((a.giou(&b) + 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_tensor_giou_matches_host_giou() {
        let device = Device::Cpu;
        let a = PredictedBox::new([0.4, 0.4, 0.4, 0.2]);
        let b = PredictedBox::new([0.5, 0.45, 0.3, 0.5]);
        let ta = box_cxcywh_to_xyxy(&Tensor::new(&[a.cxcywh], &device).unwrap()).unwrap();
        let tb = box_cxcywh_to_xyxy(&Tensor::new(&[b.cxcywh], &device).unwrap()).unwrap();

        let corners = ta.to_vec2::<f32>().unwrap();
        for (got, want) in corners[0].iter().zip(a.to_xyxy()) {
            assert!((got - want).abs() < 1e-6);
        }
        let giou = generalized_box_iou(&ta, &tb).unwrap().to_vec1::<f32>().unwrap()[0];
        assert!((giou - a.giou(&b)).abs() < 1e-5, "{giou} vs {}", a.giou(&b));
    }
}
