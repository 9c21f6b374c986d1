//! Box regression loss for grounding
//!
//! L1 over normalised (cx, cy, w, h) plus `1 - GIoU`, both summed over the
//! batch and divided by the number of boxes.

use candle_core::{DType, Result, Tensor};

use crate::boxes::{box_cxcywh_to_xyxy, generalized_box_iou};

/// Loss terms of one batch, each a scalar tensor
#[derive(Debug, Clone)]
pub struct GroundingLoss {
    pub l1: Tensor,
    pub giou: Tensor,
    pub total: Tensor,
}

impl GroundingLoss {
    pub fn total_value(&self) -> Result<f32> {
        self.total.to_dtype(DType::F32)?.to_scalar::<f32>()
    }

    /// (l1, giou) as host values for logging
    pub fn components(&self) -> Result<(f32, f32)> {
        Ok((
            self.l1.to_dtype(DType::F32)?.to_scalar::<f32>()?,
            self.giou.to_dtype(DType::F32)?.to_scalar::<f32>()?,
        ))
    }
}

/// # Arguments
/// * `pred` - [N, 4] predicted (cx, cy, w, h)
/// * `target` - [N, 4] ground truth (cx, cy, w, h)
pub fn grounding_loss(pred: &Tensor, target: &Tensor) -> Result<GroundingLoss> {
    let num_boxes = pred.dim(0)?.max(1) as f64;
    let target = target.to_dtype(pred.dtype())?;

    let l1 = ((pred - &target)?.abs()?.sum_all()? / num_boxes)?;
    let giou = generalized_box_iou(&box_cxcywh_to_xyxy(pred)?, &box_cxcywh_to_xyxy(&target)?)?;
    let giou = ((1.0 - giou)?.sum_all()? / num_boxes)?;
    let total = (&l1 + &giou)?;

    Ok(GroundingLoss { l1, giou, total })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_perfect_prediction_has_zero_loss() {
        let device = Device::Cpu;
        let boxes = Tensor::new(&[[0.5f32, 0.5, 0.2, 0.4], [0.3, 0.6, 0.1, 0.1]], &device).unwrap();
        let loss = grounding_loss(&boxes, &boxes).unwrap();
        assert!(loss.total_value().unwrap().abs() < 1e-6);
    }

    #[test]
    fn test_loss_components() {
        let device = Device::Cpu;
        // Disjoint unit quarters: L1 = 0.5 + 0.5, GIoU = -0.5
        let pred = Tensor::new(&[[0.25f32, 0.25, 0.5, 0.5]], &device).unwrap();
        let target = Tensor::new(&[[0.75f32, 0.75, 0.5, 0.5]], &device).unwrap();
        let loss = grounding_loss(&pred, &target).unwrap();
        let (l1, giou) = loss.components().unwrap();
        assert!((l1 - 1.0).abs() < 1e-6, "l1 {l1}");
        assert!((giou - 1.5).abs() < 1e-6, "giou {giou}");
        assert!((loss.total_value().unwrap() - 2.5).abs() < 1e-6);
    }
}
