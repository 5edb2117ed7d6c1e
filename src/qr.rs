//! QR payloads identifying tools.
//!
//! A payload has the form `"{tool_id}:{tool_name}:{token}"`. The random token
//! makes printed codes hard to guess but is never checked when a code is
//! scanned: only the id field is trusted.

use std::io::{Cursor, Write};

use image::{ImageFormat, Luma};
use qrcode::{EcLevel, QrCode};
use rand::{distributions::Alphanumeric, Rng};
use zip::{write::SimpleFileOptions, CompressionMethod, ZipWriter};

use crate::{db, errors::AppError, structs::Tool, AppState};

pub const TOKEN_LEN: usize = 10;
pub const ARCHIVE_NAME: &str = "qr_codes.zip";
const MODULE_PX: u32 = 10;

pub fn generate_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LEN)
        .map(char::from)
        .collect()
}

pub fn encode_payload(tool_id: i64, tool_name: &str) -> String {
    format!("{}:{}:{}", tool_id, tool_name, generate_token())
}

/// Extracts the tool id from a scanned payload.
pub fn decode_payload(payload: &str) -> Option<i64> {
    payload.trim().split(':').next()?.trim().parse().ok()
}

/// Looks up the tool a scanned payload refers to.
///
/// A bare tool name (no `:` and not numeric) is matched by exact name.
/// Anything that does not resolve yields `Ok(None)`.
pub async fn resolve_tool(state: &AppState, payload: &str) -> Result<Option<Tool>, AppError> {
    let payload = payload.trim();
    if payload.is_empty() {
        return Ok(None);
    }
    let tool = match decode_payload(payload) {
        Some(id) => db::find_tool(state, id).await?,
        None if !payload.contains(':') => db::get_tool_by_name(state, payload).await?,
        None => None,
    };
    match &tool {
        Some(t) => log::info!("QR code corresponds to tool {} ({})", t.id, t.name),
        None => log::warn!("No matching tool found for scanned code"),
    }
    Ok(tool)
}

/// Printable black-on-white PNG of a payload.
pub fn render_png(payload: &str) -> Result<Vec<u8>, AppError> {
    let code = QrCode::with_error_correction_level(payload.as_bytes(), EcLevel::H)?;
    let img = code
        .render::<Luma<u8>>()
        .quiet_zone(true)
        .module_dimensions(MODULE_PX, MODULE_PX)
        .build();
    let mut png = Cursor::new(Vec::new());
    img.write_to(&mut png, ImageFormat::Png)?;
    Ok(png.into_inner())
}

/// `"{name}_{id}_{location}_QRcode.png"`, safe to use as a single path component.
pub fn image_file_name(tool: &Tool) -> String {
    format!(
        "{}_{}_{}_QRcode.png",
        tool.name,
        tool.id,
        tool.location.replace(' ', "_")
    )
    .replace(['/', '\\'], "_")
}

/// Zip archive with one PNG per tool that has a payload.
pub fn archive(tools: &[Tool]) -> Result<Vec<u8>, AppError> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    // PNG data is already compressed
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
    for tool in tools {
        let Some(payload) = tool.qr_code.as_deref() else {
            log::warn!("Tool {} ({}) has no QR payload, skipped", tool.id, tool.name);
            continue;
        };
        writer.start_file(image_file_name(tool), options)?;
        writer.write_all(&render_png(payload)?)?;
    }
    Ok(writer.finish()?.into_inner())
}
