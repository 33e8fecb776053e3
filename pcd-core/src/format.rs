use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::pointcloud::{AttributeSchema, Point, PointAttribute, PointBatch};

/// Packed record codec for the node store and the internal binary format.
///
/// Records follow the schema's declaration order, little-endian, no padding.
/// Positions are quantized to i32 relative to `origin` (the root cube's min
/// corner) with a uniform `scale` step.
#[derive(Debug, Clone)]
pub struct RecordCodec {
    schema: AttributeSchema,
    origin: [f64; 3],
    scale: f64,
}

impl RecordCodec {
    pub fn new(schema: AttributeSchema, origin: [f64; 3], scale: f64) -> Self {
        debug_assert!(scale > 0.0);
        Self {
            schema,
            origin,
            scale,
        }
    }

    pub fn schema(&self) -> &AttributeSchema {
        &self.schema
    }

    pub fn bytes_per_point(&self) -> usize {
        self.schema.bytes_per_point()
    }

    fn quantize(&self, coordinate: f64, axis: usize) -> i32 {
        let step = ((coordinate - self.origin[axis]) / self.scale).round();
        step.clamp(i32::MIN as f64, i32::MAX as f64) as i32
    }

    fn dequantize(&self, step: i32, axis: usize) -> f64 {
        self.origin[axis] + step as f64 * self.scale
    }

    pub fn encode_batch<W: Write>(&self, batch: &PointBatch, out: &mut W) -> io::Result<()> {
        debug_assert_eq!(batch.schema(), &self.schema);
        for index in 0..batch.len() {
            let point = batch.get(index);
            for attribute in self.schema.attributes() {
                match attribute {
                    PointAttribute::PositionCartesian => {
                        for axis in 0..3 {
                            out.write_i32::<LittleEndian>(
                                self.quantize(point.position[axis], axis),
                            )?;
                        }
                    }
                    PointAttribute::ColorPacked | PointAttribute::ColorFromIntensity => {
                        out.write_all(&point.color)?;
                    }
                    PointAttribute::Intensity => {
                        out.write_u16::<LittleEndian>(point.intensity)?;
                    }
                    PointAttribute::Classification => {
                        out.write_u8(point.classification)?;
                    }
                    PointAttribute::NormalOct16 => {
                        out.write_i8(point.normal[0])?;
                        out.write_i8(point.normal[1])?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Decode at most `max_records` records; fewer on end of stream.
    pub fn decode_records<R: Read>(
        &self,
        input: &mut R,
        max_records: usize,
    ) -> io::Result<PointBatch> {
        let mut batch = PointBatch::with_capacity(self.schema.clone(), max_records);
        for _ in 0..max_records {
            let mut point = Point::default();
            let mut first = true;
            for attribute in self.schema.attributes() {
                let read = self.read_attribute(input, *attribute, &mut point);
                match read {
                    Ok(()) => {}
                    // Clean end of stream is only legal on a record boundary.
                    Err(e) if e.kind() == io::ErrorKind::UnexpectedEof && first => {
                        return Ok(batch);
                    }
                    Err(e) => return Err(e),
                }
                first = false;
            }
            batch.push(point);
        }
        Ok(batch)
    }

    pub fn decode_all(&self, bytes: &[u8]) -> io::Result<PointBatch> {
        let record = self.bytes_per_point();
        if bytes.len() % record != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "truncated record stream: {} bytes with {}-byte records",
                    bytes.len(),
                    record
                ),
            ));
        }
        let mut cursor = io::Cursor::new(bytes);
        self.decode_records(&mut cursor, bytes.len() / record)
    }

    fn read_attribute<R: Read>(
        &self,
        input: &mut R,
        attribute: PointAttribute,
        point: &mut Point,
    ) -> io::Result<()> {
        match attribute {
            PointAttribute::PositionCartesian => {
                for axis in 0..3 {
                    let step = input.read_i32::<LittleEndian>()?;
                    point.position[axis] = self.dequantize(step, axis);
                }
            }
            PointAttribute::ColorPacked | PointAttribute::ColorFromIntensity => {
                input.read_exact(&mut point.color)?;
            }
            PointAttribute::Intensity => {
                point.intensity = input.read_u16::<LittleEndian>()?;
            }
            PointAttribute::Classification => {
                point.classification = input.read_u8()?;
            }
            PointAttribute::NormalOct16 => {
                point.normal[0] = input.read_i8()?;
                point.normal[1] = input.read_i8()?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_schema() -> AttributeSchema {
        AttributeSchema::new(vec![
            PointAttribute::PositionCartesian,
            PointAttribute::ColorPacked,
            PointAttribute::Intensity,
            PointAttribute::Classification,
            PointAttribute::NormalOct16,
        ])
        .unwrap()
    }

    #[test]
    fn record_size_matches_schema() {
        let codec = RecordCodec::new(full_schema(), [0.0; 3], 0.001);
        assert_eq!(codec.bytes_per_point(), 12 + 4 + 2 + 1 + 2);
    }

    #[test]
    fn encode_decode_round_trips_within_half_scale() {
        let scale = 0.001;
        let codec = RecordCodec::new(full_schema(), [-1000.0, -1000.0, -1000.0], scale);
        let mut batch = PointBatch::new(full_schema());
        let mut x = -987.654321f64;
        for i in 0..100 {
            batch.push(Point {
                position: [x, x / 2.0, -x / 3.0],
                color: [i as u8, 0, 255 - i as u8, 255],
                intensity: i as u16 * 13,
                classification: i as u8 % 32,
                normal: [i as i8, -(i as i8)],
            });
            x += 19.731;
        }

        let mut bytes = Vec::new();
        codec.encode_batch(&batch, &mut bytes).unwrap();
        assert_eq!(bytes.len(), batch.len() * codec.bytes_per_point());

        let decoded = codec.decode_all(&bytes).unwrap();
        assert_eq!(decoded.len(), batch.len());
        for i in 0..batch.len() {
            let a = batch.get(i);
            let b = decoded.get(i);
            for axis in 0..3 {
                assert!(
                    (a.position[axis] - b.position[axis]).abs() <= scale / 2.0 + 1e-12,
                    "axis {} off by {}",
                    axis,
                    (a.position[axis] - b.position[axis]).abs()
                );
            }
            assert_eq!(a.color, b.color);
            assert_eq!(a.intensity, b.intensity);
            assert_eq!(a.classification, b.classification);
            assert_eq!(a.normal, b.normal);
        }
    }

    #[test]
    fn decode_records_stops_at_clean_eof() {
        let schema = AttributeSchema::position_only();
        let codec = RecordCodec::new(schema.clone(), [0.0; 3], 0.01);
        let mut batch = PointBatch::new(schema);
        batch.push(Point::from_position([1.0, 2.0, 3.0]));
        batch.push(Point::from_position([4.0, 5.0, 6.0]));

        let mut bytes = Vec::new();
        codec.encode_batch(&batch, &mut bytes).unwrap();

        let mut cursor = io::Cursor::new(bytes.as_slice());
        let decoded = codec.decode_records(&mut cursor, 10).unwrap();
        assert_eq!(decoded.len(), 2);
    }

    #[test]
    fn decode_all_rejects_truncated_stream() {
        let codec = RecordCodec::new(AttributeSchema::position_only(), [0.0; 3], 0.01);
        let err = codec.decode_all(&[0u8; 13]);
        assert!(err.is_err());
    }
}
