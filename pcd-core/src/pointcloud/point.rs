use crate::error::TilerError;

/// The closed set of attributes a conversion can carry. The on-disk byte
/// sizes are fixed; positions are quantized to 3x i32 when written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PointAttribute {
    PositionCartesian,
    ColorPacked,
    ColorFromIntensity,
    Intensity,
    Classification,
    NormalOct16,
}

impl PointAttribute {
    pub fn byte_size(&self) -> usize {
        match self {
            PointAttribute::PositionCartesian => 12,
            PointAttribute::ColorPacked => 4,
            PointAttribute::ColorFromIntensity => 4,
            PointAttribute::Intensity => 2,
            PointAttribute::Classification => 1,
            PointAttribute::NormalOct16 => 2,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PointAttribute::PositionCartesian => "POSITION_CARTESIAN",
            PointAttribute::ColorPacked => "COLOR_PACKED",
            PointAttribute::ColorFromIntensity => "COLOR_FROM_INTENSITY",
            PointAttribute::Intensity => "INTENSITY",
            PointAttribute::Classification => "CLASSIFICATION",
            PointAttribute::NormalOct16 => "NORMAL_OCT16",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "POSITION_CARTESIAN" => Some(PointAttribute::PositionCartesian),
            "COLOR_PACKED" | "RGB" => Some(PointAttribute::ColorPacked),
            "COLOR_FROM_INTENSITY" | "RGB_FROM_INTENSITY" => {
                Some(PointAttribute::ColorFromIntensity)
            }
            "INTENSITY" => Some(PointAttribute::Intensity),
            "CLASSIFICATION" => Some(PointAttribute::Classification),
            "NORMAL_OCT16" | "NORMAL" => Some(PointAttribute::NormalOct16),
            _ => None,
        }
    }
}

/// Ordered attribute schema, declared once per run and constant afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeSchema {
    attributes: Vec<PointAttribute>,
}

impl AttributeSchema {
    pub fn new(attributes: Vec<PointAttribute>) -> Result<Self, TilerError> {
        if attributes.is_empty() {
            return Err(TilerError::Configuration(
                "attribute schema is empty".to_string(),
            ));
        }
        if !attributes.contains(&PointAttribute::PositionCartesian) {
            return Err(TilerError::Configuration(
                "attribute schema must contain POSITION_CARTESIAN".to_string(),
            ));
        }
        for (i, a) in attributes.iter().enumerate() {
            if attributes[..i].contains(a) {
                return Err(TilerError::Configuration(format!(
                    "duplicate attribute {} in schema",
                    a.name()
                )));
            }
        }
        Ok(Self { attributes })
    }

    pub fn position_only() -> Self {
        Self {
            attributes: vec![PointAttribute::PositionCartesian],
        }
    }

    pub fn attributes(&self) -> &[PointAttribute] {
        &self.attributes
    }

    pub fn has(&self, attribute: PointAttribute) -> bool {
        self.attributes.contains(&attribute)
    }

    pub fn has_color(&self) -> bool {
        self.has(PointAttribute::ColorPacked) || self.has(PointAttribute::ColorFromIntensity)
    }

    /// Packed on-disk record size.
    pub fn bytes_per_point(&self) -> usize {
        self.attributes.iter().map(|a| a.byte_size()).sum()
    }

    /// Resident in-memory size of one record in a columnar batch; the
    /// memory governor multiplies this by the resident point count.
    pub fn mem_bytes_per_point(&self) -> usize {
        let mut bytes = std::mem::size_of::<[f64; 3]>();
        if self.has_color() {
            bytes += std::mem::size_of::<[u8; 4]>();
        }
        if self.has(PointAttribute::Intensity) {
            bytes += std::mem::size_of::<u16>();
        }
        if self.has(PointAttribute::Classification) {
            bytes += std::mem::size_of::<u8>();
        }
        if self.has(PointAttribute::NormalOct16) {
            bytes += std::mem::size_of::<[i8; 2]>();
        }
        bytes
    }

    pub fn names(&self) -> Vec<String> {
        self.attributes.iter().map(|a| a.name().to_string()).collect()
    }
}

/// Row view of a single point. Columns absent from the schema read as their
/// defaults and are ignored on push.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Point {
    pub position: [f64; 3],
    pub color: [u8; 4],
    pub intensity: u16,
    pub classification: u8,
    pub normal: [i8; 2],
}

impl Point {
    pub fn from_position(position: [f64; 3]) -> Self {
        Self {
            position,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_requires_position() {
        let err = AttributeSchema::new(vec![PointAttribute::Intensity]);
        assert!(err.is_err());
    }

    #[test]
    fn schema_rejects_duplicates() {
        let err = AttributeSchema::new(vec![
            PointAttribute::PositionCartesian,
            PointAttribute::Intensity,
            PointAttribute::Intensity,
        ]);
        assert!(err.is_err());
    }

    #[test]
    fn bytes_per_point_sums_attribute_sizes() {
        let schema = AttributeSchema::new(vec![
            PointAttribute::PositionCartesian,
            PointAttribute::ColorPacked,
            PointAttribute::Intensity,
        ])
        .unwrap();
        assert_eq!(schema.bytes_per_point(), 12 + 4 + 2);
    }

    #[test]
    fn attribute_names_round_trip() {
        for a in [
            PointAttribute::PositionCartesian,
            PointAttribute::ColorPacked,
            PointAttribute::ColorFromIntensity,
            PointAttribute::Intensity,
            PointAttribute::Classification,
            PointAttribute::NormalOct16,
        ] {
            assert_eq!(PointAttribute::from_name(a.name()), Some(a));
        }
    }
}
