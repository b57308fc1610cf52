//! Terminal QR rendering for universal links.
//!
//! Two QR rows share one terminal row through Unicode half blocks, which
//! keeps modules roughly square on a typical 2:1 terminal cell.

use qrcodegen::{QrCode, QrCodeEcc};

/// Light border around the symbol, in modules.
const QUIET_ZONE: i32 = 2;

/// Render `data` as terminal lines that fit within `max_width` x `max_height`.
///
/// Error correction is lowered step by step until the symbol fits. Returns
/// `None` if the data is too long for any QR code or the symbol does not fit.
pub fn render_lines(data: &str, max_width: u16, max_height: u16) -> Option<Vec<String>> {
    for ecc in [QrCodeEcc::Medium, QrCodeEcc::Low] {
        let Ok(code) = QrCode::encode_text(data, ecc) else {
            log::warn!("Link too long for a QR code ({} chars)", data.len());
            return None;
        };

        let total = code.size() + QUIET_ZONE * 2;
        let width = total as u16;
        let height = ((total + 1) / 2) as u16;
        if width > max_width || height > max_height {
            log::debug!(
                "QR code with {:?} needs {}x{} (max: {}x{})",
                ecc,
                width,
                height,
                max_width,
                max_height
            );
            continue;
        }

        // `get_module` reports light outside the symbol, which draws the quiet zone
        let dark = |x: i32, y: i32| code.get_module(x - QUIET_ZONE, y - QUIET_ZONE);

        let lines = (0..total)
            .step_by(2)
            .map(|upper| {
                (0..total)
                    .map(|x| match (dark(x, upper), dark(x, upper + 1)) {
                        (true, true) => '█',
                        (true, false) => '▀',
                        (false, true) => '▄',
                        (false, false) => ' ',
                    })
                    .collect()
            })
            .collect();
        return Some(lines);
    }
    None
}
