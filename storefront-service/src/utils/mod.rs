// Utils module

use anyhow::Result;
use base64::{engine::general_purpose, Engine as _};
use image::{DynamicImage, Luma};
use qrcode::QrCode;
use std::io::Cursor;

/// Currencies Stripe treats as having no minor unit.
const ZERO_DECIMAL_CURRENCIES: &[&str] = &[
    "BIF", "CLP", "DJF", "GNF", "JPY", "KMF", "KRW", "MGA", "PYG", "RWF", "UGX", "VND", "VUV",
    "XAF", "XOF", "XPF",
];

/// Number of minor-unit digits for an ISO 4217 currency code.
pub fn minor_unit_digits(currency: &str) -> u32 {
    if ZERO_DECIMAL_CURRENCIES
        .iter()
        .any(|c| c.eq_ignore_ascii_case(currency))
    {
        0
    } else {
        2
    }
}

/// Convert a major-unit amount to minor units, rounding half away from zero.
pub fn to_minor_units(amount: f64, currency: &str) -> i64 {
    let factor = 10f64.powi(minor_unit_digits(currency) as i32);
    (amount * factor).round() as i64
}

/// Round a major-unit amount to the currency's precision.
pub fn round_price(amount: f64, currency: &str) -> f64 {
    let factor = 10f64.powi(minor_unit_digits(currency) as i32);
    (amount * factor).round() / factor
}

/// Order total in minor units: unit price × quantity, rounded once.
pub fn order_amount_minor(unit_price: f64, quantity: u32, currency: &str) -> i64 {
    to_minor_units(unit_price * quantity as f64, currency)
}

/// Render an eSIM activation string (LPA code) as a base64-encoded PNG QR code.
pub fn generate_qr_base64(data: &str) -> Result<String> {
    let code = QrCode::new(data.as_bytes())?;
    let image = code.render::<Luma<u8>>().min_dimensions(256, 256).build();

    let dynamic_image = DynamicImage::ImageLuma8(image);
    let mut buffer = Cursor::new(Vec::new());
    dynamic_image.write_to(&mut buffer, image::ImageOutputFormat::Png)?;

    Ok(general_purpose::STANDARD.encode(buffer.get_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minor_units_two_decimals() {
        assert_eq!(to_minor_units(4.99, "USD"), 499);
        assert_eq!(to_minor_units(0.1 + 0.2, "usd"), 30);
        assert_eq!(to_minor_units(19.999, "EUR"), 2000);
    }

    #[test]
    fn test_minor_units_zero_decimal() {
        assert_eq!(minor_unit_digits("JPY"), 0);
        assert_eq!(to_minor_units(1200.4, "JPY"), 1200);
    }

    #[test]
    fn test_order_amount_is_price_times_quantity() {
        assert_eq!(order_amount_minor(4.99, 3, "USD"), 1497);
        assert_eq!(order_amount_minor(12.35, 1, "USD"), 1235);
        assert_eq!(order_amount_minor(1.15, 7, "USD"), 805);
    }

    #[test]
    fn test_round_price() {
        assert_eq!(round_price(5.857, "USD"), 5.86);
        assert_eq!(round_price(650.6, "JPY"), 651.0);
    }

    #[test]
    fn test_qr_code_is_png() {
        let encoded = generate_qr_base64("LPA:1$rsp.example.com$ABC123").unwrap();
        let bytes = general_purpose::STANDARD.decode(encoded).unwrap();
        assert_eq!(&bytes[1..4], b"PNG");
    }
}
