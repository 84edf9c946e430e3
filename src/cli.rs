//! Command-line surface (spec.md §6 "CLI surface — peripheral, spec'd
//! minimally"): one positional image path plus `name=value` options,
//! unrecognized options rejected outright. Parsing style mirrors
//! `config::Config::parse`'s line-oriented `name=value` splitting, adapted
//! to argv tokens instead of lines.

use std::path::{Path, PathBuf};

use crate::error::DcError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Disc,
    Bin,
    Trace,
}

fn classify(path: &Path) -> Result<ImageKind, DcError> {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("gdi") | Some("cdi") | Some("chd") => Ok(ImageKind::Disc),
        Some("bin") => Ok(ImageKind::Bin),
        Some("trace") => Ok(ImageKind::Trace),
        _ => Err(DcError::UnsupportedImage(path.to_path_buf())),
    }
}

#[derive(Debug, Clone)]
pub struct Args {
    pub image: PathBuf,
    pub kind: ImageKind,
    pub options: Vec<(String, String)>,
}

/// Parses `argv[1..]`: the first positional token names the image; every
/// later token must be a `name=value` pair. Anything else is rejected
/// (spec.md §6: "unrecognized options are rejected").
pub fn parse(argv: &[String]) -> Result<Args, DcError> {
    let mut image: Option<PathBuf> = None;
    let mut options = Vec::new();

    for arg in argv {
        match arg.split_once('=') {
            Some((key, value)) => options.push((key.trim().to_string(), value.trim().to_string())),
            None if image.is_none() => image = Some(PathBuf::from(arg)),
            None => return Err(DcError::UnknownOption(arg.clone())),
        }
    }

    let image = image.ok_or(DcError::MissingImage)?;
    let kind = classify(&image)?;
    Ok(Args { image, kind, options })
}
