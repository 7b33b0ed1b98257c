static DECIMAL_ABBREVIATIONS: [&str; 9] = ["B", "kB", "MB", "GB", "TB", "PB", "EB", "ZB", "YB"];

/// Decimal human-readable size, three significant digits.
pub fn human_size(size: f64) -> String {
    human_size_with_precision(size, 3)
}

pub fn human_size_with_precision(size: f64, precision: usize) -> String {
    let mut size = size;
    let mut index = 0;
    while size >= 1000.0 && index < DECIMAL_ABBREVIATIONS.len() - 1 {
        size /= 1000.0;
        index += 1;
    }
    format!("{:.*}{}", precision_for(size, precision), size, DECIMAL_ABBREVIATIONS[index])
}

fn precision_for(size: f64, significant: usize) -> usize {
    let integer_digits = if size < 1.0 {
        1
    } else {
        (size.log10().floor() as usize) + 1
    };
    significant.saturating_sub(integer_digits)
}
