use crate::error::Em2Error;
use crate::readout::ReadoutBuffer;
use textplots::{Chart, Plot, Shape};

const DEFAULT_WIDTH: u32 = 120;
const DEFAULT_HEIGHT: u32 = 40;

/// Determine the best scale and SI prefix for a given maximum value
fn determine_scale(max_value: f64) -> (f64, &'static str) {
    if max_value >= 1.0 || max_value == 0.0 {
        (1.0, "")
    } else if max_value >= 1e-3 {
        (1e3, "m")
    } else if max_value >= 1e-6 {
        (1e6, "μ")
    } else if max_value >= 1e-9 {
        (1e9, "n")
    } else if max_value >= 1e-12 {
        (1e12, "p")
    } else {
        (1e15, "f")
    }
}

/// Plot a converted channel series in the terminal with automatic SI scaling.
///
/// # Arguments
/// * `values` - Converted samples, one per trigger
/// * `title` - Optional title printed above the chart
/// * `unit` - Unit of the converted values, e.g. `"A"`
///
/// # Examples
/// ```
/// use rusty_em::plotting::plot_series;
///
/// let data = vec![1e-12, 2e-12, 1.5e-12, 3e-12];
/// plot_series(&data, Some("CHAN01"), "A").unwrap();
/// ```
pub fn plot_series(values: &[f64], title: Option<&str>, unit: &str) -> Result<(), Em2Error> {
    if values.is_empty() {
        return Err(Em2Error::Usage("Cannot plot empty data".to_string()));
    }

    let min_value = values.iter().fold(f64::INFINITY, |a, &b| a.min(b));
    let max_value = values.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));
    let (scale, prefix) = determine_scale(max_value.abs().max(min_value.abs()));

    println!("{}", title.unwrap_or("Channel readout"));
    println!(
        "{} sample(s) | {:.3} to {:.3} {prefix}{unit}",
        values.len(),
        min_value * scale,
        max_value * scale,
    );

    // nothing to draw without x or y extent
    if values.len() < 2 || min_value == max_value {
        return Ok(());
    }

    let frame: Vec<(f32, f32)> = values
        .iter()
        .enumerate()
        .map(|(i, &value)| (i as f32, (value * scale) as f32))
        .collect();

    Chart::new(DEFAULT_WIDTH, DEFAULT_HEIGHT, 0.0, (values.len() - 1) as f32)
        .lineplot(&Shape::Lines(&frame))
        .nice();
    println!("Sample →");

    Ok(())
}

/// Plot one instrument channel of a readout slice.
pub fn plot_channel(buffer: &ReadoutBuffer, channel: u8, unit: &str) -> Result<(), Em2Error> {
    let row = buffer
        .row(channel as usize)
        .filter(|_| channel > 0)
        .ok_or_else(|| Em2Error::Usage(format!("No channel {channel} in readout")))?;
    plot_series(&row.to_vec(), Some(&format!("CHAN{channel:02}")), unit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_determine_scale() {
        assert_eq!(determine_scale(5.0), (1.0, ""));
        assert_eq!(determine_scale(0.0), (1.0, ""));
        assert_eq!(determine_scale(0.005), (1e3, "m"));
        assert_eq!(determine_scale(5e-6), (1e6, "μ"));
        assert_eq!(determine_scale(5e-9), (1e9, "n"));
        assert_eq!(determine_scale(5e-12), (1e12, "p"));
        assert_eq!(determine_scale(5e-14), (1e15, "f"));
    }

    #[test]
    fn test_plot_series() {
        assert!(plot_series(&[1.0, 2.0, 3.0, 2.0, 1.0], Some("Test Plot"), "A").is_ok());
        assert!(plot_series(&[5e-7], None, "A").is_ok());
        assert!(plot_series(&[], None, "A").is_err());
    }

    #[test]
    fn test_plot_channel() {
        let buffer =
            ReadoutBuffer::assemble(0.1, vec![vec![1e-9, 2e-9, 3e-9], vec![0.0; 3]]).unwrap();
        assert!(plot_channel(&buffer, 1, "A").is_ok());
        assert!(plot_channel(&buffer, 2, "A").is_ok());
        assert!(plot_channel(&buffer, 0, "s").is_err());
        assert!(plot_channel(&buffer, 3, "A").is_err());
    }
}
