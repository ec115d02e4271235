//! Readers for COLMAP's text model (`cameras.txt`, `images.txt`,
//! `points3D.txt`).

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use ctcalib_core::{CalibError, Quat, Vec2, Vec3};
use nalgebra::Quaternion;

#[derive(Debug, Clone, PartialEq)]
pub struct ColmapCamera {
    pub id: u64,
    pub model: String,
    pub width: u32,
    pub height: u32,
    pub params: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColmapPoint2D {
    pub uv: Vec2,
    /// `None` for features without a triangulated point (`-1`).
    pub point3d_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColmapImage {
    pub id: u64,
    /// World-to-camera rotation.
    pub q_cw: Quat,
    /// World-to-camera translation.
    pub t_cw: Vec3,
    pub camera_id: u64,
    pub name: String,
    pub points2d: Vec<ColmapPoint2D>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColmapPoint3D {
    pub id: u64,
    pub xyz: Vec3,
    pub rgb: [u8; 3],
    pub error: f64,
    /// `(image id, index into the image's 2D points)`
    pub track: Vec<(u64, usize)>,
}

fn malformed(file: &str, line: usize, what: impl std::fmt::Display) -> CalibError {
    CalibError::Format(format!("{file} line {line}: {what}"))
}

fn field<T: FromStr>(tokens: &[&str], idx: usize, file: &str, line: usize) -> Result<T, CalibError> {
    let token = tokens
        .get(idx)
        .ok_or_else(|| malformed(file, line, format!("missing field {idx}")))?;
    token
        .parse()
        .map_err(|_| malformed(file, line, format!("cannot parse '{token}'")))
}

/// Non-comment lines with their 1-based line numbers. Blank lines are kept
/// because an image without features has an empty point line.
fn content_lines(text: &str) -> Vec<(usize, &str)> {
    text.lines()
        .enumerate()
        .filter(|(_, l)| !l.trim_start().starts_with('#'))
        .map(|(i, l)| (i + 1, l.trim()))
        .collect()
}

fn read(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| CalibError::io(path, e).into())
}

pub fn parse_cameras(text: &str) -> Result<BTreeMap<u64, ColmapCamera>, CalibError> {
    const FILE: &str = "cameras.txt";
    let mut cameras = BTreeMap::new();
    for (line, content) in content_lines(text) {
        if content.is_empty() {
            continue;
        }
        let tokens: Vec<&str> = content.split_whitespace().collect();
        let camera = ColmapCamera {
            id: field(&tokens, 0, FILE, line)?,
            model: field(&tokens, 1, FILE, line)?,
            width: field(&tokens, 2, FILE, line)?,
            height: field(&tokens, 3, FILE, line)?,
            params: (4..tokens.len())
                .map(|i| field(&tokens, i, FILE, line))
                .collect::<Result<_, _>>()?,
        };
        cameras.insert(camera.id, camera);
    }
    Ok(cameras)
}

pub fn parse_images(text: &str) -> Result<BTreeMap<u64, ColmapImage>, CalibError> {
    const FILE: &str = "images.txt";
    let lines = content_lines(text);
    let mut images = BTreeMap::new();
    let mut idx = 0;
    while idx < lines.len() {
        let (line, header) = lines[idx];
        idx += 1;
        if header.is_empty() {
            continue;
        }
        let tokens: Vec<&str> = header.split_whitespace().collect();
        let q = Quaternion::new(
            field(&tokens, 1, FILE, line)?,
            field(&tokens, 2, FILE, line)?,
            field(&tokens, 3, FILE, line)?,
            field(&tokens, 4, FILE, line)?,
        );
        let mut image = ColmapImage {
            id: field(&tokens, 0, FILE, line)?,
            q_cw: Quat::from_quaternion(q),
            t_cw: Vec3::new(
                field(&tokens, 5, FILE, line)?,
                field(&tokens, 6, FILE, line)?,
                field(&tokens, 7, FILE, line)?,
            ),
            camera_id: field(&tokens, 8, FILE, line)?,
            name: tokens[9..].join(" "),
            points2d: Vec::new(),
        };
        if image.name.is_empty() {
            return Err(malformed(FILE, line, "missing image name"));
        }

        if let Some(&(line, points)) = lines.get(idx) {
            idx += 1;
            let tokens: Vec<&str> = points.split_whitespace().collect();
            if tokens.len() % 3 != 0 {
                return Err(malformed(FILE, line, "2D points come in triplets"));
            }
            for chunk in 0..tokens.len() / 3 {
                let x: f64 = field(&tokens, 3 * chunk, FILE, line)?;
                let y: f64 = field(&tokens, 3 * chunk + 1, FILE, line)?;
                let id: i64 = field(&tokens, 3 * chunk + 2, FILE, line)?;
                image.points2d.push(ColmapPoint2D {
                    uv: Vec2::new(x, y),
                    point3d_id: u64::try_from(id).ok(),
                });
            }
        }
        images.insert(image.id, image);
    }
    Ok(images)
}

pub fn parse_points3d(text: &str) -> Result<BTreeMap<u64, ColmapPoint3D>, CalibError> {
    const FILE: &str = "points3D.txt";
    let mut points = BTreeMap::new();
    for (line, content) in content_lines(text) {
        if content.is_empty() {
            continue;
        }
        let tokens: Vec<&str> = content.split_whitespace().collect();
        if tokens.len() < 8 || (tokens.len() - 8) % 2 != 0 {
            return Err(malformed(FILE, line, "unexpected number of fields"));
        }
        let track = (0..(tokens.len() - 8) / 2)
            .map(|k| {
                Ok((
                    field(&tokens, 8 + 2 * k, FILE, line)?,
                    field(&tokens, 9 + 2 * k, FILE, line)?,
                ))
            })
            .collect::<Result<Vec<_>, CalibError>>()?;
        let point = ColmapPoint3D {
            id: field(&tokens, 0, FILE, line)?,
            xyz: Vec3::new(
                field(&tokens, 1, FILE, line)?,
                field(&tokens, 2, FILE, line)?,
                field(&tokens, 3, FILE, line)?,
            ),
            rgb: [
                field(&tokens, 4, FILE, line)?,
                field(&tokens, 5, FILE, line)?,
                field(&tokens, 6, FILE, line)?,
            ],
            error: field(&tokens, 7, FILE, line)?,
            track,
        };
        points.insert(point.id, point);
    }
    Ok(points)
}

pub fn read_cameras(path: &Path) -> Result<BTreeMap<u64, ColmapCamera>> {
    parse_cameras(&read(path)?).with_context(|| format!("reading '{}'", path.display()))
}

pub fn read_images(path: &Path) -> Result<BTreeMap<u64, ColmapImage>> {
    parse_images(&read(path)?).with_context(|| format!("reading '{}'", path.display()))
}

pub fn read_points3d(path: &Path) -> Result<BTreeMap<u64, ColmapPoint3D>> {
    parse_points3d(&read(path)?).with_context(|| format!("reading '{}'", path.display()))
}
