// src/vehicle_detection.rs
//
// YOLOv8 vehicle detector over ONNX Runtime. Letterbox preprocessing
// is done with OpenCV; postprocessing keeps only COCO vehicle classes
// and applies confidence filtering plus NMS.

use anyhow::Result;
use opencv::{
    core::{self, Mat, Scalar},
    imgproc,
    prelude::*,
};
use ort::{
    execution_providers::CUDAExecutionProvider,
    session::{builder::GraphOptimizationLevel, Session},
};
use tracing::{debug, info};

const YOLO_INPUT_SIZE: i32 = 640;
const YOLO_CLASSES: usize = 80;
const YOLO_PREDICTIONS: usize = 8400;

// COCO ids: car, motorcycle, bus, truck
const VEHICLE_CLASSES: [usize; 4] = [2, 3, 5, 7];

#[derive(Debug, Clone)]
pub struct Detection {
    /// [x1, y1, x2, y2] in working-resolution coordinates
    pub bbox: [f32; 4],
    pub confidence: f32,
    pub class_id: usize,
    pub class_name: &'static str,
}

impl Detection {
    pub fn centroid(&self) -> (f32, f32) {
        (
            (self.bbox[0] + self.bbox[2]) / 2.0,
            (self.bbox[1] + self.bbox[3]) / 2.0,
        )
    }
}

pub struct VehicleDetector {
    session: Session,
    nms_iou_threshold: f32,
}

impl VehicleDetector {
    pub fn new(model_path: &str, nms_iou_threshold: f32) -> Result<Self> {
        info!("Loading YOLO model: {}", model_path);

        let session = Session::builder()?
            .with_execution_providers([CUDAExecutionProvider::default().with_device_id(0).build()])?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?
            .commit_from_file(model_path)?;

        info!("✓ Vehicle detector initialized");
        Ok(Self {
            session,
            nms_iou_threshold,
        })
    }

    pub fn detect(&mut self, bgr: &Mat, confidence_floor: f32) -> Result<Vec<Detection>> {
        let (input, scale, pad_x, pad_y) = preprocess(bgr)?;
        let output = self.infer(&input)?;
        let detections = self.postprocess(&output, scale, pad_x, pad_y, confidence_floor);
        debug!("detected {} vehicle(s)", detections.len());
        Ok(detections)
    }

    fn infer(&mut self, input: &[f32]) -> Result<Vec<f32>> {
        let shape = [1, 3, YOLO_INPUT_SIZE as usize, YOLO_INPUT_SIZE as usize];
        let input_value =
            ort::value::Value::from_array((shape.as_slice(), input.to_vec().into_boxed_slice()))?;

        let outputs = self.session.run(ort::inputs!["images" => input_value])?;
        let output = &outputs[0];
        let (_, data) = output.try_extract_tensor::<f32>()?;

        Ok(data.to_vec())
    }

    /// YOLOv8 head layout: [1, 84, 8400] — 4 box rows then 80 class
    /// confidence rows, one column per prediction.
    fn postprocess(
        &self,
        output: &[f32],
        scale: f32,
        pad_x: f32,
        pad_y: f32,
        confidence_floor: f32,
    ) -> Vec<Detection> {
        let mut detections = Vec::new();

        for i in 0..YOLO_PREDICTIONS {
            let mut max_conf = 0.0f32;
            let mut best_class = 0usize;
            for c in 0..YOLO_CLASSES {
                let conf = output[YOLO_PREDICTIONS * (4 + c) + i];
                if conf > max_conf {
                    max_conf = conf;
                    best_class = c;
                }
            }
            if max_conf < confidence_floor || !VEHICLE_CLASSES.contains(&best_class) {
                continue;
            }

            let cx = output[i];
            let cy = output[YOLO_PREDICTIONS + i];
            let w = output[YOLO_PREDICTIONS * 2 + i];
            let h = output[YOLO_PREDICTIONS * 3 + i];

            // center format -> corners, then reverse the letterbox
            let bbox = [
                (cx - w / 2.0 - pad_x) / scale,
                (cy - h / 2.0 - pad_y) / scale,
                (cx + w / 2.0 - pad_x) / scale,
                (cy + h / 2.0 - pad_y) / scale,
            ];

            detections.push(Detection {
                bbox,
                confidence: max_conf,
                class_id: best_class,
                class_name: class_name(best_class),
            });
        }

        nms(detections, self.nms_iou_threshold)
    }
}

/// Letterbox the BGR frame into a 640x640 RGB CHW tensor normalized to
/// [0,1]. Returns the tensor plus the scale and padding needed to map
/// detections back to working-resolution coordinates.
fn preprocess(bgr: &Mat) -> Result<(Vec<f32>, f32, f32, f32)> {
    let size = bgr.size()?;
    let target = YOLO_INPUT_SIZE;
    let scale =
        (target as f32 / size.width as f32).min(target as f32 / size.height as f32);
    let scaled_w = (size.width as f32 * scale) as i32;
    let scaled_h = (size.height as f32 * scale) as i32;

    let mut resized = Mat::default();
    imgproc::resize(
        bgr,
        &mut resized,
        core::Size::new(scaled_w, scaled_h),
        0.0,
        0.0,
        imgproc::INTER_LINEAR,
    )?;

    let pad_left = (target - scaled_w) / 2;
    let pad_top = (target - scaled_h) / 2;
    let mut canvas = Mat::default();
    core::copy_make_border(
        &resized,
        &mut canvas,
        pad_top,
        target - scaled_h - pad_top,
        pad_left,
        target - scaled_w - pad_left,
        core::BORDER_CONSTANT,
        Scalar::all(114.0),
    )?;

    let mut rgb = Mat::default();
    imgproc::cvt_color(&canvas, &mut rgb, imgproc::COLOR_BGR2RGB, 0)?;
    let data = rgb.data_bytes()?;

    // HWC u8 -> CHW f32
    let hw = (target * target) as usize;
    let mut input = vec![0.0f32; 3 * hw];
    for px in 0..hw {
        for c in 0..3 {
            input[c * hw + px] = data[px * 3 + c] as f32 / 255.0;
        }
    }

    Ok((input, scale, pad_left as f32, pad_top as f32))
}

fn class_name(class_id: usize) -> &'static str {
    match class_id {
        2 => "car",
        3 => "motorcycle",
        5 => "bus",
        7 => "truck",
        _ => "unknown",
    }
}

fn nms(detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    let mut order: Vec<usize> = (0..detections.len()).collect();
    order.sort_by(|&a, &b| {
        detections[b]
            .confidence
            .partial_cmp(&detections[a].confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut suppressed = vec![false; detections.len()];
    let mut keep = Vec::new();
    for &i in &order {
        if suppressed[i] {
            continue;
        }
        keep.push(detections[i].clone());
        for &j in &order {
            if j != i && !suppressed[j] && iou(&detections[i].bbox, &detections[j].bbox) >= iou_threshold
            {
                suppressed[j] = true;
            }
        }
    }
    keep
}

pub fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let x1 = a[0].max(b[0]);
    let y1 = a[1].max(b[1]);
    let x2 = a[2].min(b[2]);
    let y2 = a[3].min(b[3]);

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let area_a = (a[2] - a[0]) * (a[3] - a[1]);
    let area_b = (b[2] - b[0]) * (b[3] - b[1]);
    let union = area_a + area_b - intersection;

    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(bbox: [f32; 4], confidence: f32) -> Detection {
        Detection {
            bbox,
            confidence,
            class_id: 2,
            class_name: "car",
        }
    }

    #[test]
    fn test_iou_partial_overlap() {
        let a = [0.0, 0.0, 100.0, 100.0];
        let b = [50.0, 50.0, 150.0, 150.0];
        assert!((iou(&a, &b) - 2500.0 / 17500.0).abs() < 0.01);
    }

    #[test]
    fn test_iou_disjoint_is_zero() {
        let a = [0.0, 0.0, 50.0, 50.0];
        let b = [100.0, 100.0, 200.0, 200.0];
        assert_eq!(iou(&a, &b), 0.0);
    }

    #[test]
    fn test_nms_keeps_highest_confidence() {
        let dets = vec![
            det([0.0, 0.0, 100.0, 100.0], 0.6),
            det([5.0, 5.0, 105.0, 105.0], 0.9),
            det([300.0, 300.0, 400.0, 400.0], 0.7),
        ];
        let kept = nms(dets, 0.45);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].confidence, 0.9);
    }

    #[test]
    fn test_centroid_is_box_center() {
        let d = det([10.0, 20.0, 30.0, 60.0], 0.9);
        assert_eq!(d.centroid(), (20.0, 40.0));
    }
}
