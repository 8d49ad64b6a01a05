use std::{
    path::{Path, PathBuf},
    process::{Command, Output},
};

use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use snipseek::{
    EncoderConfig, HybridEncoder,
    encoder::{Backbone, PositionalEncoding},
    model_manager,
};

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn snipseek_bin() -> Result<PathBuf, Box<dyn std::error::Error>> {
    if let Ok(bin) = std::env::var("CARGO_BIN_EXE_snipseek") {
        return Ok(PathBuf::from(bin));
    }

    let mut path = std::env::current_exe()?;
    path.pop();
    if path.ends_with("deps") {
        path.pop();
    }
    path.push("snipseek");

    if cfg!(windows) {
        path.set_extension("exe");
    }

    Ok(path)
}

fn run(data_dir: &Path, args: &[&str]) -> Result<Output, Box<dyn std::error::Error>> {
    let output = Command::new(snipseek_bin()?)
        .arg("--data-dir")
        .arg(data_dir)
        .arg("--quiet")
        .args(args)
        .env_remove("SNIPSEEK_LOG")
        .output()?;
    Ok(output)
}

fn write_pages(dir: &Path) -> Result<(), Box<dyn std::error::Error>> {
    std::fs::create_dir_all(dir)?;
    let colors = [("report", [200, 40, 40]), ("manual", [40, 40, 200])];
    for (pdf, color) in colors {
        for page in 1..=2u8 {
            let mut img = image::RgbImage::from_pixel(80, 100, image::Rgb(color));
            for y in (0..100).step_by(10 * page as usize) {
                for x in 0..80 {
                    img.put_pixel(x, y, image::Rgb([255, 255, 255]));
                }
            }
            img.save(dir.join(format!("{pdf}_page_{page}.png")))?;
        }
    }
    Ok(())
}

fn write_weights(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let config = EncoderConfig {
        backbone: Backbone::Resnet18,
        embed_dim: 16,
        num_layers: 1,
        num_heads: 2,
        image_size: 64,
        positional: PositionalEncoding::Zero,
    };
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    HybridEncoder::new(&config, vb)?;
    model_manager::save_weights(&varmap, &config, path)?;
    Ok(())
}

#[test]
fn prepare_writes_training_pairs() -> TestResult {
    let tmp = tempfile::tempdir()?;
    let pages = tmp.path().join("pages");
    write_pages(&pages)?;

    let output = run(
        tmp.path(),
        &["prepare", "--pages-dir", pages.to_str().unwrap(), "--crops-per-page", "2"],
    )?;
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let raw = std::fs::read_to_string(tmp.path().join("training_pairs.json"))?;
    let pairs: Vec<serde_json::Value> = serde_json::from_str(&raw)?;
    assert!(!pairs.is_empty());
    for pair in &pairs {
        assert!(pair.get("pdf_id").is_some());
        assert!(pair.get("bbox").is_some());
    }
    Ok(())
}

#[test]
fn build_then_query_as_json() -> TestResult {
    let tmp = tempfile::tempdir()?;
    let pages = tmp.path().join("pages");
    write_pages(&pages)?;
    write_weights(&tmp.path().join("encoder.safetensors"))?;

    let output = run(
        tmp.path(),
        &["build", "--pages", pages.to_str().unwrap(), "--device", "cpu"],
    )?;
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert!(tmp.path().join("index.redb").is_file());
    assert!(tmp.path().join("embeddings.bin").is_file());
    assert!(tmp.path().join("pages_meta.json").is_file());

    let snippet = tmp.path().join("snippet.png");
    std::fs::copy(pages.join("manual_page_2.png"), &snippet)?;
    let output = run(
        tmp.path(),
        &[
            "query",
            "--snippet",
            snippet.to_str().unwrap(),
            "-k",
            "2",
            "--no-verify",
            "--json",
            "--device",
            "cpu",
        ],
    )?;
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let json: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    let results = json["results"].as_array().expect("results array");
    assert_eq!(results.len(), 2);
    assert_eq!(results[0]["pdf_id"], "manual");
    assert_eq!(results[0]["page_number"], 2);
    assert_eq!(results[0]["ocr_match"], false);
    Ok(())
}

#[test]
fn query_rejects_architecture_override() -> TestResult {
    let tmp = tempfile::tempdir()?;
    let pages = tmp.path().join("pages");
    write_pages(&pages)?;
    write_weights(&tmp.path().join("encoder.safetensors"))?;
    let built = run(tmp.path(), &["build", "--pages", pages.to_str().unwrap(), "--device", "cpu"])?;
    assert!(built.status.success());

    let output = run(
        tmp.path(),
        &[
            "query",
            "--snippet",
            pages.join("report_page_1.png").to_str().unwrap(),
            "--no-verify",
            "--device",
            "cpu",
            "--embed-dim",
            "32",
        ],
    )?;
    assert!(!output.status.success());
    Ok(())
}

#[test]
fn missing_snippet_fails() -> TestResult {
    let tmp = tempfile::tempdir()?;
    let output = run(tmp.path(), &["query", "--snippet", "nope.png", "--no-verify"])?;
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("nope.png"));
    Ok(())
}

#[test]
fn completions_need_no_data_dir() -> TestResult {
    let output = Command::new(snipseek_bin()?).args(["completions", "bash"]).output()?;
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("snipseek"));
    Ok(())
}
