//! Command line tests that do not need model files.

use assert_cmd::Command;
use ndarray::Array2;
use ndarray_npy::write_npy;
use predicates::prelude::*;

fn facevision() -> Command {
    Command::cargo_bin("facevision").unwrap()
}

#[test]
fn priors_prints_anchor_count() {
    facevision()
        .args(["priors", "--width", "320", "--height", "240"])
        .assert()
        .success()
        .stdout(predicate::str::diff("4420\n"));
}

#[test]
fn decode_reads_npy_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let anchors = 4420;

    let mut scores = Array2::<f32>::zeros((anchors, 2));
    scores.column_mut(0).fill(1.0);
    scores[[0, 0]] = 0.1;
    scores[[0, 1]] = 0.9;
    scores[[anchors - 1, 0]] = 0.2;
    scores[[anchors - 1, 1]] = 0.8;
    let boxes = Array2::<f32>::zeros((anchors, 4));

    let scores_path = dir.path().join("scores.npy");
    let boxes_path = dir.path().join("boxes.npy");
    write_npy(&scores_path, &scores).unwrap();
    write_npy(&boxes_path, &boxes).unwrap();

    facevision()
        .current_dir(dir.path())
        .arg("decode")
        .arg("--scores")
        .arg(&scores_path)
        .arg("--boxes")
        .arg(&boxes_path)
        .assert()
        .success()
        .stdout(predicate::str::starts_with("2 faces\n"))
        .stdout(predicate::str::contains("0.900"))
        .stdout(predicate::str::contains("0.800"));

    // a higher threshold keeps only the stronger anchor
    facevision()
        .current_dir(dir.path())
        .arg("decode")
        .arg("--scores")
        .arg(&scores_path)
        .arg("--boxes")
        .arg(&boxes_path)
        .args(["--score-threshold", "0.85"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("1 faces\n"));
}

#[test]
fn decode_rejects_mismatched_lengths() {
    let dir = tempfile::tempdir().unwrap();
    let scores_path = dir.path().join("scores.npy");
    let boxes_path = dir.path().join("boxes.npy");
    write_npy(&scores_path, &Array2::<f32>::zeros((10, 2))).unwrap();
    write_npy(&boxes_path, &Array2::<f32>::zeros((10, 4))).unwrap();

    facevision()
        .current_dir(dir.path())
        .arg("decode")
        .arg("--scores")
        .arg(&scores_path)
        .arg("--boxes")
        .arg(&boxes_path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("shape mismatch for scores"));
}

#[test]
fn threshold_outside_unit_range_is_rejected() {
    facevision()
        .args(["decode", "--scores", "a.npy", "--boxes", "b.npy", "--iou-threshold", "1.5"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("1.5 is not in 0.0..=1.0"));
}

#[test]
fn invalid_config_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("facevision.toml"), "[classifier]\ntop_k = 0\n").unwrap();

    facevision()
        .current_dir(dir.path())
        .arg("priors")
        .assert()
        .failure()
        .stderr(predicate::str::contains("top_k"));
}

#[test]
fn run_without_images_fails() {
    let dir = tempfile::tempdir().unwrap();
    facevision()
        .current_dir(dir.path())
        .args(["run", "."])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no image files"));
}

#[test]
fn run_with_missing_model_reports_analysis_error() {
    let dir = tempfile::tempdir().unwrap();
    image::RgbImage::from_pixel(64, 48, image::Rgb([10, 10, 10]))
        .save(dir.path().join("frame.png"))
        .unwrap();

    facevision()
        .current_dir(dir.path())
        .args(["run", "--preset", "ultranet", "--model", "missing.onnx", "frame.png"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("error during image analysis"));
}

#[test]
fn raw_size_must_be_width_x_height() {
    facevision()
        .args(["run", "--raw-size", "640", "dump.yuv"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("expected WIDTHxHEIGHT"));
}

#[test]
fn raw_dump_reaches_analysis() {
    let dir = tempfile::tempdir().unwrap();
    // two 4x2 I420 frames
    std::fs::write(dir.path().join("dump.yuv"), vec![128u8; 24]).unwrap();

    facevision()
        .current_dir(dir.path())
        .args(["run", "--raw-size", "4x2", "--model", "missing.onnx", "dump.yuv"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("error during image analysis"));
}

#[test]
fn raw_dump_shorter_than_a_frame_fails() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("dump.yuv"), vec![128u8; 5]).unwrap();

    facevision()
        .current_dir(dir.path())
        .args(["run", "--raw-size", "4x2", "dump.yuv"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no whole 4x2 frames"));
}
