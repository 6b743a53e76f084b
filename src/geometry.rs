//! Geometry values for product footprints.
//!
//! Coordinates are (x = longitude, y = latitude) in WGS84 (SRID 4326).
//! Values are pure data; the codecs translate to and from WKT, GeoJSON, and
//! (hex-)EWKB, and [`Geometry::wrap`] converts spherical geometry onto the
//! flat lon/lat canvas by splitting at the dateline and unfolding polar caps.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use serde_json::json;

use crate::error::{Error, Result};

const SRID_WGS84: u32 = 4326;
const EWKB_SRID_FLAG: u32 = 0x2000_0000;

const TYPE_POINT: u32 = 1;
const TYPE_LINESTRING: u32 = 2;
const TYPE_POLYGON: u32 = 3;
const TYPE_MULTIPOINT: u32 = 4;
const TYPE_MULTILINESTRING: u32 = 5;
const TYPE_MULTIPOLYGON: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Point { x, y }
    }

    pub fn longitude(&self) -> f64 {
        self.x
    }

    pub fn latitude(&self) -> f64 {
        self.y
    }

    /// Map the longitude into [-180, 180]. Assumes the input longitude is
    /// already within [-360, 360].
    pub fn wrap(&self) -> Point {
        let lon = if self.x < -180.0 {
            self.x + 360.0
        } else if self.x > 180.0 {
            self.x - 360.0
        } else {
            self.x
        };
        Point::new(lon, self.y)
    }

    fn wkt_coords(&self) -> String {
        format!("{:.6} {:.6}", self.x, self.y)
    }
}

/// A chain of two or more points (or none).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LineString(pub Vec<Point>);

/// A closed chain of points, stored without a closing duplicate when it comes
/// from a parser; ring construction elsewhere may carry one.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LinearRing(pub Vec<Point>);

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Polygon(pub Vec<LinearRing>);

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MultiPoint(pub Vec<Point>);

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MultiLineString(pub Vec<LineString>);

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MultiPolygon(pub Vec<Polygon>);

impl LineString {
    /// A line string is empty or contains at least two points.
    pub fn new(points: Vec<Point>) -> Result<Self> {
        if points.len() == 1 {
            return Err(Error::User(
                "line string should be empty or should contain >= 2 points".to_string(),
            ));
        }
        Ok(LineString(points))
    }
}

impl LinearRing {
    /// A linear ring is empty or contains at least three points.
    pub fn new(points: Vec<Point>) -> Result<Self> {
        if !points.is_empty() && points.len() < 3 {
            return Err(Error::User(
                "linear ring should be empty or should contain >= 3 points".to_string(),
            ));
        }
        Ok(LinearRing(points))
    }
}

impl Polygon {
    pub fn exterior_ring(&self) -> Option<&LinearRing> {
        self.0.first()
    }
}

/// Return whether a point sequence rotates anti-clockwise (1.0), clockwise
/// (-1.0) or not at all (0.0, empty or degenerate), from the sum of outer
/// products of consecutive points.
pub fn polygon_rotation(points: &[Point]) -> f64 {
    if points.is_empty() {
        return 0.0;
    }
    let mut sum = 0.0;
    let mut prev = &points[0];
    for point in &points[1..] {
        sum += point.y * prev.x - point.x * prev.y;
        prev = point;
    }
    if sum == 0.0 {
        0.0
    } else {
        sum.signum()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Geometry {
    Point(Point),
    LineString(LineString),
    Polygon(Polygon),
    MultiPoint(MultiPoint),
    MultiLineString(MultiLineString),
    MultiPolygon(MultiPolygon),
}

impl Geometry {
    pub fn type_name(&self) -> &'static str {
        match self {
            Geometry::Point(_) => "Point",
            Geometry::LineString(_) => "LineString",
            Geometry::Polygon(_) => "Polygon",
            Geometry::MultiPoint(_) => "MultiPoint",
            Geometry::MultiLineString(_) => "MultiLineString",
            Geometry::MultiPolygon(_) => "MultiPolygon",
        }
    }

    /// Convert the geometry from one on a sphere to one that fits on a 2D
    /// lon/lat canvas with -90 <= lat <= 90 and -180 <= lon <= 180. Lines and
    /// polygons are split at the dateline; polygons covering a pole get polar
    /// edges inserted so the flat shape still covers the polar region.
    pub fn wrap(&self) -> Geometry {
        match self {
            Geometry::Point(point) => Geometry::Point(point.wrap()),
            Geometry::LineString(line) => wrap_line_string(line),
            Geometry::Polygon(polygon) => wrap_polygon(polygon),
            Geometry::MultiPoint(points) => {
                Geometry::MultiPoint(MultiPoint(points.0.iter().map(Point::wrap).collect()))
            }
            Geometry::MultiLineString(lines) => {
                let mut wrapped = Vec::new();
                for line in &lines.0 {
                    match wrap_line_string(line) {
                        Geometry::MultiLineString(parts) => wrapped.extend(parts.0),
                        Geometry::LineString(line) => wrapped.push(line),
                        _ => {}
                    }
                }
                Geometry::MultiLineString(MultiLineString(wrapped))
            }
            Geometry::MultiPolygon(polygons) => {
                let mut wrapped = Vec::new();
                for polygon in &polygons.0 {
                    match wrap_polygon(polygon) {
                        Geometry::MultiPolygon(parts) => wrapped.extend(parts.0),
                        Geometry::Polygon(polygon) => wrapped.push(polygon),
                        _ => {}
                    }
                }
                Geometry::MultiPolygon(MultiPolygon(wrapped))
            }
        }
    }

    pub fn as_wkt(&self) -> String {
        match self {
            Geometry::Point(point) => format!("POINT ({})", point.wkt_coords()),
            Geometry::LineString(line) => format!("LINESTRING {}", line_wkt(&line.0)),
            Geometry::Polygon(polygon) => format!("POLYGON {}", polygon_wkt(polygon)),
            Geometry::MultiPoint(points) => {
                if points.0.is_empty() {
                    "MULTIPOINT EMPTY".to_string()
                } else {
                    let parts: Vec<String> = points
                        .0
                        .iter()
                        .map(|point| format!("({})", point.wkt_coords()))
                        .collect();
                    format!("MULTIPOINT ({})", parts.join(", "))
                }
            }
            Geometry::MultiLineString(lines) => {
                if lines.0.is_empty() {
                    "MULTILINESTRING EMPTY".to_string()
                } else {
                    let parts: Vec<String> =
                        lines.0.iter().map(|line| line_wkt(&line.0)).collect();
                    format!("MULTILINESTRING ({})", parts.join(", "))
                }
            }
            Geometry::MultiPolygon(polygons) => {
                if polygons.0.is_empty() {
                    "MULTIPOLYGON EMPTY".to_string()
                } else {
                    let parts: Vec<String> =
                        polygons.0.iter().map(polygon_wkt).collect();
                    format!("MULTIPOLYGON ({})", parts.join(", "))
                }
            }
        }
    }

    pub fn as_geojson(&self) -> serde_json::Value {
        match self {
            Geometry::Point(point) => json!({
                "type": "Point",
                "coordinates": [point.x, point.y],
            }),
            Geometry::LineString(line) => json!({
                "type": "LineString",
                "coordinates": coords_of(&line.0),
            }),
            Geometry::Polygon(polygon) => json!({
                "type": "Polygon",
                "coordinates": polygon.0.iter().map(|ring| coords_of(&ring.0)).collect::<Vec<_>>(),
            }),
            Geometry::MultiPoint(points) => json!({
                "type": "MultiPoint",
                "coordinates": coords_of(&points.0),
            }),
            Geometry::MultiLineString(lines) => json!({
                "type": "MultiLineString",
                "coordinates": lines.0.iter().map(|line| coords_of(&line.0)).collect::<Vec<_>>(),
            }),
            Geometry::MultiPolygon(polygons) => json!({
                "type": "MultiPolygon",
                "coordinates": polygons
                    .0
                    .iter()
                    .map(|polygon| polygon.0.iter().map(|ring| coords_of(&ring.0)).collect::<Vec<_>>())
                    .collect::<Vec<_>>(),
            }),
        }
    }

    pub fn from_geojson(geojson: &serde_json::Value) -> Result<Geometry> {
        let kind = geojson
            .get("type")
            .and_then(|value| value.as_str())
            .ok_or_else(|| Error::User("geojson geometry without type".to_string()))?;
        let coordinates = geojson
            .get("coordinates")
            .ok_or_else(|| Error::User("geojson geometry without coordinates".to_string()))?;

        match kind {
            "Point" => Ok(Geometry::Point(json_point(coordinates)?)),
            "LineString" => Ok(Geometry::LineString(LineString::new(json_points(
                coordinates,
            )?)?)),
            "Polygon" => Ok(Geometry::Polygon(json_polygon(coordinates)?)),
            "MultiPoint" => Ok(Geometry::MultiPoint(MultiPoint(json_points(coordinates)?))),
            "MultiLineString" => {
                let mut lines = Vec::new();
                for item in json_array(coordinates)? {
                    lines.push(LineString::new(json_points(item)?)?);
                }
                Ok(Geometry::MultiLineString(MultiLineString(lines)))
            }
            "MultiPolygon" => {
                let mut polygons = Vec::new();
                for item in json_array(coordinates)? {
                    polygons.push(json_polygon(item)?);
                }
                Ok(Geometry::MultiPolygon(MultiPolygon(polygons)))
            }
            other => Err(Error::User(format!(
                "cannot convert geojson type: {}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for Geometry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_wkt())
    }
}

fn line_wkt(points: &[Point]) -> String {
    if points.is_empty() {
        "EMPTY".to_string()
    } else {
        let parts: Vec<String> = points.iter().map(Point::wkt_coords).collect();
        format!("({})", parts.join(", "))
    }
}

fn ring_wkt(ring: &LinearRing) -> String {
    if ring.0.is_empty() {
        "EMPTY".to_string()
    } else {
        let mut parts: Vec<String> = ring.0.iter().map(Point::wkt_coords).collect();
        parts.push(ring.0[0].wkt_coords());
        format!("({})", parts.join(", "))
    }
}

fn polygon_wkt(polygon: &Polygon) -> String {
    if polygon.0.is_empty() {
        "EMPTY".to_string()
    } else {
        let parts: Vec<String> = polygon.0.iter().map(ring_wkt).collect();
        format!("({})", parts.join(", "))
    }
}

fn coords_of(points: &[Point]) -> Vec<[f64; 2]> {
    points.iter().map(|point| [point.x, point.y]).collect()
}

fn json_array(value: &serde_json::Value) -> Result<&Vec<serde_json::Value>> {
    value
        .as_array()
        .ok_or_else(|| Error::User("geojson coordinates must be arrays".to_string()))
}

fn json_point(value: &serde_json::Value) -> Result<Point> {
    let array = json_array(value)?;
    if array.len() < 2 {
        return Err(Error::User("geojson position needs two ordinates".to_string()));
    }
    let x = array[0]
        .as_f64()
        .ok_or_else(|| Error::User("geojson ordinate must be a number".to_string()))?;
    let y = array[1]
        .as_f64()
        .ok_or_else(|| Error::User("geojson ordinate must be a number".to_string()))?;
    Ok(Point::new(x, y))
}

fn json_points(value: &serde_json::Value) -> Result<Vec<Point>> {
    json_array(value)?.iter().map(json_point).collect()
}

fn json_polygon(value: &serde_json::Value) -> Result<Polygon> {
    let mut rings = Vec::new();
    for item in json_array(value)? {
        rings.push(LinearRing::new(json_points(item)?)?);
    }
    Ok(Polygon(rings))
}

// ---------------------------------------------------------------------------
// Dateline wrapping
// ---------------------------------------------------------------------------

fn wrap_line_string(line: &LineString) -> Geometry {
    if line.0.is_empty() {
        return Geometry::LineString(line.clone());
    }

    let first = line.0[0].wrap();
    let (mut prev_lon, mut prev_lat) = (first.x, first.y);
    let mut finished: Vec<Vec<Point>> = Vec::new();
    let mut current = vec![first];

    for point in &line.0[1..] {
        let point = point.wrap();
        let (lon, lat) = (point.x, point.y);
        // lon mapped to [prev_lon - 180, prev_lon + 180]
        let rel_lon = if lon < prev_lon - 180.0 {
            lon + 360.0
        } else if lon > prev_lon + 180.0 {
            lon - 360.0
        } else {
            lon
        };
        if rel_lon < -180.0 {
            let mid_lat = lat + ((-180.0 - rel_lon) / (prev_lon - rel_lon)) * (prev_lat - lat);
            current.push(Point::new(-180.0, mid_lat));
            finished.push(std::mem::replace(
                &mut current,
                vec![Point::new(180.0, mid_lat)],
            ));
        } else if rel_lon > 180.0 {
            let mid_lat = prev_lat + ((180.0 - prev_lon) / (rel_lon - prev_lon)) * (lat - prev_lat);
            current.push(Point::new(180.0, mid_lat));
            finished.push(std::mem::replace(
                &mut current,
                vec![Point::new(-180.0, mid_lat)],
            ));
        }
        prev_lon = lon;
        prev_lat = lat;
        current.push(point);
    }
    finished.push(current);

    if finished.len() > 1 {
        Geometry::MultiLineString(MultiLineString(
            finished.into_iter().map(LineString).collect(),
        ))
    } else {
        Geometry::LineString(LineString(finished.remove(0)))
    }
}

fn wrap_polygon(polygon: &Polygon) -> Geometry {
    // Only the outer ring is wrapped; exclusion regions are dropped.
    let ring = match polygon.exterior_ring() {
        Some(ring) if !ring.0.is_empty() => ring,
        _ => return Geometry::Polygon(polygon.clone()),
    };

    let first = ring.0[0].wrap();
    let (mut prev_lon, mut prev_lat) = (first.x, first.y);
    // current_area = {-1: lon < -180, 0: -180 <= lon <= 180, 1: lon >= 180}
    let mut current_area = 0i32;
    let mut finished: Vec<Vec<Point>> = Vec::new();
    let mut current = vec![first];
    let mut crossing_lat: Vec<f64> = Vec::new();

    for point in &ring.0[1..] {
        let point = point.wrap();
        let (lon, lat) = (point.x, point.y);
        let rel_lon = if lon < prev_lon - 180.0 {
            lon + 360.0
        } else if lon > prev_lon + 180.0 {
            lon - 360.0
        } else {
            lon
        };
        if rel_lon < -180.0 {
            if current_area == -1 {
                // polygon wraps around the globe more than once
                return Geometry::Polygon(polygon.clone());
            }
            let mid_lat = lat + ((-180.0 - rel_lon) / (prev_lon - rel_lon)) * (prev_lat - lat);
            crossing_lat.push(mid_lat);
            current.push(Point::new(-180.0, mid_lat));
            finished.push(std::mem::replace(
                &mut current,
                vec![Point::new(180.0, mid_lat)],
            ));
            current_area -= 1;
        } else if rel_lon > 180.0 {
            if current_area == 1 {
                return Geometry::Polygon(polygon.clone());
            }
            let mid_lat = prev_lat + ((180.0 - prev_lon) / (rel_lon - prev_lon)) * (lat - prev_lat);
            crossing_lat.push(mid_lat);
            current.push(Point::new(180.0, mid_lat));
            finished.push(std::mem::replace(
                &mut current,
                vec![Point::new(-180.0, mid_lat)],
            ));
            current_area += 1;
        }
        prev_lon = lon;
        prev_lat = lat;
        current.push(point);
    }

    let mut pts_set = finished;
    pts_set.push(current);

    if pts_set.len() == 1 {
        let points = pts_set.remove(0);
        if polygon_rotation(&points) < 0.0 {
            // Clockwise orientation selects the complement region: the shape
            // becomes a hole in the full-earth bounding box.
            let world = LinearRing(vec![
                Point::new(-180.0, -90.0),
                Point::new(180.0, -90.0),
                Point::new(180.0, 90.0),
                Point::new(-180.0, 90.0),
                Point::new(-180.0, -90.0),
            ]);
            return Geometry::Polygon(Polygon(vec![world, LinearRing(points)]));
        }
        return Geometry::Polygon(Polygon(vec![LinearRing(points)]));
    }

    // The final run of points belongs in front of the first ring.
    let mut last = match pts_set.pop() {
        Some(last) => last,
        None => return Geometry::Polygon(polygon.clone()),
    };
    if last.last() == pts_set[0].first() {
        last.pop();
    }
    let head = std::mem::take(&mut pts_set[0]);
    last.extend(head);
    pts_set[0] = last;

    // Connect segments across the north pole when needed.
    if !crossing_lat.is_empty() {
        let max_index = index_of_extreme(&crossing_lat, true);
        let next_index = if max_index < crossing_lat.len() - 1 {
            max_index + 1
        } else {
            0
        };
        if segment_end_x(&pts_set[max_index]) > segment_start_x(&pts_set[next_index]) {
            pts_set[max_index].push(Point::new(180.0, 90.0));
            pts_set[max_index].push(Point::new(-180.0, 90.0));
            if max_index != next_index {
                let next = std::mem::take(&mut pts_set[next_index]);
                pts_set[max_index].extend(next);
                let merged = std::mem::take(&mut pts_set[max_index]);
                pts_set[next_index] = merged;
                pts_set.remove(max_index);
                crossing_lat.remove(max_index);
            }
        }
    }

    // And across the south pole.
    if !crossing_lat.is_empty() {
        let min_index = index_of_extreme(&crossing_lat, false);
        let next_index = if min_index < crossing_lat.len() - 1 {
            min_index + 1
        } else {
            0
        };
        if segment_end_x(&pts_set[min_index]) < segment_start_x(&pts_set[next_index]) {
            pts_set[min_index].push(Point::new(-180.0, -90.0));
            pts_set[min_index].push(Point::new(180.0, -90.0));
            if min_index != next_index {
                let next = std::mem::take(&mut pts_set[next_index]);
                pts_set[min_index].extend(next);
                let merged = std::mem::take(&mut pts_set[min_index]);
                pts_set[next_index] = merged;
                pts_set.remove(min_index);
            }
        }
    }

    for points in pts_set.iter_mut() {
        if let Some(first) = points.first().copied() {
            points.push(first);
        }
    }

    if pts_set.len() == 1 {
        Geometry::Polygon(Polygon(vec![LinearRing(pts_set.remove(0))]))
    } else {
        Geometry::MultiPolygon(MultiPolygon(
            pts_set
                .into_iter()
                .map(|points| Polygon(vec![LinearRing(points)]))
                .collect(),
        ))
    }
}

fn index_of_extreme(values: &[f64], maximum: bool) -> usize {
    let mut index = 0;
    for (i, value) in values.iter().enumerate() {
        let better = if maximum {
            *value > values[index]
        } else {
            *value < values[index]
        };
        if better {
            index = i;
        }
    }
    index
}

fn segment_end_x(points: &[Point]) -> f64 {
    points.last().map(|point| point.x).unwrap_or(0.0)
}

fn segment_start_x(points: &[Point]) -> f64 {
    points.first().map(|point| point.x).unwrap_or(0.0)
}

// ---------------------------------------------------------------------------
// EWKB
// ---------------------------------------------------------------------------

struct EwkbWriter {
    buffer: Vec<u8>,
    little_endian: bool,
    srid: Option<u32>,
}

impl EwkbWriter {
    fn new(little_endian: bool, srid: Option<u32>) -> Self {
        EwkbWriter {
            buffer: Vec::new(),
            little_endian,
            srid,
        }
    }

    fn write_u32(&mut self, value: u32) {
        let mut bytes = [0u8; 4];
        if self.little_endian {
            LittleEndian::write_u32(&mut bytes, value);
        } else {
            BigEndian::write_u32(&mut bytes, value);
        }
        self.buffer.extend_from_slice(&bytes);
    }

    fn write_f64(&mut self, value: f64) {
        let mut bytes = [0u8; 8];
        if self.little_endian {
            LittleEndian::write_f64(&mut bytes, value);
        } else {
            BigEndian::write_f64(&mut bytes, value);
        }
        self.buffer.extend_from_slice(&bytes);
    }

    fn write_tag(&mut self, geometry_type: u32, srid: bool) {
        self.buffer.push(u8::from(self.little_endian));
        match self.srid {
            Some(code) if srid => {
                self.write_u32(geometry_type | EWKB_SRID_FLAG);
                self.write_u32(code);
            }
            _ => self.write_u32(geometry_type),
        }
    }

    fn write_points(&mut self, points: &[Point]) {
        self.write_u32(points.len() as u32);
        for point in points {
            self.write_f64(point.x);
            self.write_f64(point.y);
        }
    }

    fn write_ring(&mut self, ring: &LinearRing) {
        if ring.0.is_empty() {
            self.write_u32(0);
            return;
        }
        self.write_u32(ring.0.len() as u32 + 1);
        for point in &ring.0 {
            self.write_f64(point.x);
            self.write_f64(point.y);
        }
        self.write_f64(ring.0[0].x);
        self.write_f64(ring.0[0].y);
    }

    fn write_polygon_body(&mut self, polygon: &Polygon) {
        self.write_u32(polygon.0.len() as u32);
        for ring in &polygon.0 {
            self.write_ring(ring);
        }
    }

    fn write_geometry(&mut self, geometry: &Geometry, srid: bool) {
        match geometry {
            Geometry::Point(point) => {
                self.write_tag(TYPE_POINT, srid);
                self.write_f64(point.x);
                self.write_f64(point.y);
            }
            Geometry::LineString(line) => {
                self.write_tag(TYPE_LINESTRING, srid);
                self.write_points(&line.0);
            }
            Geometry::Polygon(polygon) => {
                self.write_tag(TYPE_POLYGON, srid);
                self.write_polygon_body(polygon);
            }
            Geometry::MultiPoint(points) => {
                self.write_tag(TYPE_MULTIPOINT, srid);
                self.write_u32(points.0.len() as u32);
                for point in &points.0 {
                    self.write_geometry(&Geometry::Point(*point), false);
                }
            }
            Geometry::MultiLineString(lines) => {
                self.write_tag(TYPE_MULTILINESTRING, srid);
                self.write_u32(lines.0.len() as u32);
                for line in &lines.0 {
                    self.write_geometry(&Geometry::LineString(line.clone()), false);
                }
            }
            Geometry::MultiPolygon(polygons) => {
                self.write_tag(TYPE_MULTIPOLYGON, srid);
                self.write_u32(polygons.0.len() as u32);
                for polygon in &polygons.0 {
                    self.write_geometry(&Geometry::Polygon(polygon.clone()), false);
                }
            }
        }
    }
}

/// Encode a geometry as little-endian EWKB with an SRID 4326 prefix.
pub fn encode_ewkb(geometry: &Geometry) -> Vec<u8> {
    let mut writer = EwkbWriter::new(true, Some(SRID_WGS84));
    writer.write_geometry(geometry, true);
    writer.buffer
}

pub fn encode_hexewkb(geometry: &Geometry) -> String {
    hex::encode_upper(encode_ewkb(geometry))
}

struct EwkbReader<'a> {
    bytes: &'a [u8],
    offset: usize,
    little_endian: bool,
}

impl<'a> EwkbReader<'a> {
    fn new(bytes: &'a [u8]) -> Result<Self> {
        let mut reader = EwkbReader {
            bytes,
            offset: 0,
            little_endian: true,
        };
        let endianness = reader.read_u8()?;
        reader.little_endian = endianness != 0;
        Ok(reader)
    }

    fn read_u8(&mut self) -> Result<u8> {
        let byte = self
            .bytes
            .get(self.offset)
            .copied()
            .ok_or_else(|| Error::User("EWKB decoding error: unexpected end of data".to_string()))?;
        self.offset += 1;
        Ok(byte)
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8]> {
        let end = self.offset + count;
        let slice = self
            .bytes
            .get(self.offset..end)
            .ok_or_else(|| Error::User("EWKB decoding error: unexpected end of data".to_string()))?;
        self.offset = end;
        Ok(slice)
    }

    fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(if self.little_endian {
            LittleEndian::read_u32(bytes)
        } else {
            BigEndian::read_u32(bytes)
        })
    }

    fn read_f64(&mut self) -> Result<f64> {
        let bytes = self.take(8)?;
        Ok(if self.little_endian {
            LittleEndian::read_f64(bytes)
        } else {
            BigEndian::read_f64(bytes)
        })
    }

    fn read_point(&mut self) -> Result<Point> {
        let x = self.read_f64()?;
        let y = self.read_f64()?;
        Ok(Point::new(x, y))
    }

    fn read_points(&mut self) -> Result<Vec<Point>> {
        let count = self.read_u32()? as usize;
        let mut points = Vec::with_capacity(count);
        for _ in 0..count {
            points.push(self.read_point()?);
        }
        Ok(points)
    }

    fn read_ring(&mut self) -> Result<LinearRing> {
        let points = self.read_points()?;
        if points.is_empty() {
            return LinearRing::new(points);
        }
        if points.len() < 4 {
            return Err(Error::User(
                "linear ring should be empty or should contain >= 4 points".to_string(),
            ));
        }
        if points.last() != points.first() {
            return Err(Error::User("linear ring should be closed".to_string()));
        }
        let mut points = points;
        points.pop();
        LinearRing::new(points)
    }

    fn read_geometry(&mut self, expected_type: Option<u32>) -> Result<Geometry> {
        let raw_type = self.read_u32()?;
        let geometry_type = raw_type & 0x00FF_FFFF;
        let flags = raw_type >> 28;

        if let Some(expected) = expected_type {
            if geometry_type != expected {
                return Err(Error::User(format!(
                    "unexpected EWKB type code: {} (expected: {})",
                    geometry_type, expected
                )));
            }
        }

        if flags == 0x02 {
            let srid = self.read_u32()?;
            if srid != SRID_WGS84 {
                return Err(Error::User(format!("unsupported SRID code: {}", srid)));
            }
        } else if flags != 0x00 {
            return Err(Error::User(format!(
                "unsupported EWKB type flags: {}",
                flags
            )));
        }

        match geometry_type {
            TYPE_POINT => Ok(Geometry::Point(self.read_point()?)),
            TYPE_LINESTRING => Ok(Geometry::LineString(LineString::new(self.read_points()?)?)),
            TYPE_POLYGON => {
                let count = self.read_u32()? as usize;
                let mut rings = Vec::with_capacity(count);
                for _ in 0..count {
                    rings.push(self.read_ring()?);
                }
                Ok(Geometry::Polygon(Polygon(rings)))
            }
            TYPE_MULTIPOINT => {
                let mut points = Vec::new();
                for geometry in self.read_sequence(TYPE_POINT)? {
                    if let Geometry::Point(point) = geometry {
                        points.push(point);
                    }
                }
                Ok(Geometry::MultiPoint(MultiPoint(points)))
            }
            TYPE_MULTILINESTRING => {
                let mut lines = Vec::new();
                for geometry in self.read_sequence(TYPE_LINESTRING)? {
                    if let Geometry::LineString(line) = geometry {
                        lines.push(line);
                    }
                }
                Ok(Geometry::MultiLineString(MultiLineString(lines)))
            }
            TYPE_MULTIPOLYGON => {
                let mut polygons = Vec::new();
                for geometry in self.read_sequence(TYPE_POLYGON)? {
                    if let Geometry::Polygon(polygon) = geometry {
                        polygons.push(polygon);
                    }
                }
                Ok(Geometry::MultiPolygon(MultiPolygon(polygons)))
            }
            other => Err(Error::User(format!(
                "unsupported EWKB type code: {}",
                other
            ))),
        }
    }

    fn read_sequence(&mut self, expected_type: u32) -> Result<Vec<Geometry>> {
        let count = self.read_u32()? as usize;
        let mut sequence = Vec::with_capacity(count);
        for _ in 0..count {
            // Every element restates its own endianness.
            let mut reader = EwkbReader::new(&self.bytes[self.offset..])?;
            let geometry = reader.read_geometry(Some(expected_type))?;
            self.offset += reader.offset;
            sequence.push(geometry);
        }
        Ok(sequence)
    }
}

pub fn decode_ewkb(ewkb: &[u8]) -> Result<Geometry> {
    let mut reader = EwkbReader::new(ewkb)?;
    reader.read_geometry(None)
}

pub fn decode_hexewkb(hexewkb: &str) -> Result<Geometry> {
    let bytes = hex::decode(hexewkb)
        .map_err(|error| Error::User(format!("EWKB decoding error: {}", error)))?;
    decode_ewkb(&bytes)
}

// ---------------------------------------------------------------------------
// Spatial predicates
//
// These back the covers/intersects SQL functions of the sqlite catalogue.
// Holes are honored for containment; boundaries count as covered.
// ---------------------------------------------------------------------------

fn orientation(a: &Point, b: &Point, c: &Point) -> f64 {
    (b.x - a.x) * (c.y - a.y) - (b.y - a.y) * (c.x - a.x)
}

fn point_on_segment(p: &Point, a: &Point, b: &Point) -> bool {
    if orientation(a, b, p).abs() > 1e-12 {
        return false;
    }
    p.x >= a.x.min(b.x) - 1e-12
        && p.x <= a.x.max(b.x) + 1e-12
        && p.y >= a.y.min(b.y) - 1e-12
        && p.y <= a.y.max(b.y) + 1e-12
}

fn segments_intersect(a1: &Point, a2: &Point, b1: &Point, b2: &Point) -> bool {
    let d1 = orientation(b1, b2, a1);
    let d2 = orientation(b1, b2, a2);
    let d3 = orientation(a1, a2, b1);
    let d4 = orientation(a1, a2, b2);

    if ((d1 > 0.0 && d2 < 0.0) || (d1 < 0.0 && d2 > 0.0))
        && ((d3 > 0.0 && d4 < 0.0) || (d3 < 0.0 && d4 > 0.0))
    {
        return true;
    }

    point_on_segment(a1, b1, b2)
        || point_on_segment(a2, b1, b2)
        || point_on_segment(b1, a1, a2)
        || point_on_segment(b2, a1, a2)
}

/// Edges of a ring; a stored closing duplicate is harmless (the closing edge
/// degenerates to a point).
fn ring_edges(points: &[Point]) -> Vec<(Point, Point)> {
    let mut edges = Vec::new();
    if points.len() < 2 {
        return edges;
    }
    for window in points.windows(2) {
        edges.push((window[0], window[1]));
    }
    if points.first() != points.last() {
        if let (Some(first), Some(last)) = (points.first(), points.last()) {
            edges.push((*last, *first));
        }
    }
    edges
}

fn point_in_ring(p: &Point, points: &[Point]) -> bool {
    for (a, b) in ring_edges(points) {
        if point_on_segment(p, &a, &b) {
            return true;
        }
    }

    let mut inside = false;
    for (a, b) in ring_edges(points) {
        if (a.y > p.y) != (b.y > p.y) {
            let x = a.x + (p.y - a.y) / (b.y - a.y) * (b.x - a.x);
            if x > p.x {
                inside = !inside;
            }
        }
    }
    inside
}

fn point_in_polygon(p: &Point, polygon: &Polygon) -> bool {
    let exterior = match polygon.exterior_ring() {
        Some(ring) => ring,
        None => return false,
    };
    if !point_in_ring(p, &exterior.0) {
        return false;
    }
    for hole in &polygon.0[1..] {
        let on_boundary = ring_edges(&hole.0)
            .iter()
            .any(|(a, b)| point_on_segment(p, a, b));
        if !on_boundary && point_in_ring(p, &hole.0) {
            return false;
        }
    }
    true
}

fn polygon_edges(polygon: &Polygon) -> Vec<(Point, Point)> {
    polygon
        .0
        .iter()
        .flat_map(|ring| ring_edges(&ring.0))
        .collect()
}

fn simple_parts(geometry: &Geometry) -> Vec<Geometry> {
    match geometry {
        Geometry::MultiPoint(points) => {
            points.0.iter().map(|point| Geometry::Point(*point)).collect()
        }
        Geometry::MultiLineString(lines) => lines
            .0
            .iter()
            .map(|line| Geometry::LineString(line.clone()))
            .collect(),
        Geometry::MultiPolygon(polygons) => polygons
            .0
            .iter()
            .map(|polygon| Geometry::Polygon(polygon.clone()))
            .collect(),
        other => vec![other.clone()],
    }
}

fn simple_intersects(a: &Geometry, b: &Geometry) -> bool {
    match (a, b) {
        (Geometry::Point(p), Geometry::Point(q)) => {
            (p.x - q.x).abs() <= 1e-12 && (p.y - q.y).abs() <= 1e-12
        }
        (Geometry::Point(p), Geometry::LineString(line))
        | (Geometry::LineString(line), Geometry::Point(p)) => line_segments(line)
            .iter()
            .any(|(s, e)| point_on_segment(p, s, e)),
        (Geometry::Point(p), Geometry::Polygon(polygon))
        | (Geometry::Polygon(polygon), Geometry::Point(p)) => point_in_polygon(p, polygon),
        (Geometry::LineString(a), Geometry::LineString(b)) => {
            line_segments(a).iter().any(|(a1, a2)| {
                line_segments(b)
                    .iter()
                    .any(|(b1, b2)| segments_intersect(a1, a2, b1, b2))
            })
        }
        (Geometry::LineString(line), Geometry::Polygon(polygon))
        | (Geometry::Polygon(polygon), Geometry::LineString(line)) => {
            line.0.iter().any(|p| point_in_polygon(p, polygon))
                || line_segments(line).iter().any(|(a1, a2)| {
                    polygon_edges(polygon)
                        .iter()
                        .any(|(b1, b2)| segments_intersect(a1, a2, b1, b2))
                })
        }
        (Geometry::Polygon(a), Geometry::Polygon(b)) => {
            a.0.first()
                .map(|ring| ring.0.iter().any(|p| point_in_polygon(p, b)))
                .unwrap_or(false)
                || b.0
                    .first()
                    .map(|ring| ring.0.iter().any(|p| point_in_polygon(p, a)))
                    .unwrap_or(false)
                || polygon_edges(a).iter().any(|(a1, a2)| {
                    polygon_edges(b)
                        .iter()
                        .any(|(b1, b2)| segments_intersect(a1, a2, b1, b2))
                })
        }
        _ => false,
    }
}

fn line_segments(line: &LineString) -> Vec<(Point, Point)> {
    line.0.windows(2).map(|pair| (pair[0], pair[1])).collect()
}

fn simple_covers(a: &Geometry, b: &Geometry) -> bool {
    match (a, b) {
        (Geometry::Point(p), other) => match other {
            Geometry::Point(q) => (p.x - q.x).abs() <= 1e-12 && (p.y - q.y).abs() <= 1e-12,
            _ => false,
        },
        (Geometry::LineString(line), Geometry::Point(p)) => line_segments(line)
            .iter()
            .any(|(s, e)| point_on_segment(p, s, e)),
        (Geometry::LineString(a), Geometry::LineString(b)) => b.0.iter().all(|p| {
            line_segments(a)
                .iter()
                .any(|(s, e)| point_on_segment(p, s, e))
        }),
        (Geometry::LineString(_), _) => false,
        (Geometry::Polygon(polygon), Geometry::Point(p)) => point_in_polygon(p, polygon),
        (Geometry::Polygon(polygon), Geometry::LineString(line)) => {
            line.0.iter().all(|p| point_in_polygon(p, polygon))
                && !crosses_properly(&line_segments(line), &polygon_edges(polygon))
        }
        (Geometry::Polygon(a), Geometry::Polygon(b)) => {
            b.0.first()
                .map(|ring| ring.0.iter().all(|p| point_in_polygon(p, a)))
                .unwrap_or(false)
                && !crosses_properly(&polygon_edges(b), &polygon_edges(a))
        }
        _ => false,
    }
}

fn crosses_properly(edges: &[(Point, Point)], boundary: &[(Point, Point)]) -> bool {
    edges.iter().any(|(a1, a2)| {
        boundary.iter().any(|(b1, b2)| {
            let d1 = orientation(b1, b2, a1);
            let d2 = orientation(b1, b2, a2);
            let d3 = orientation(a1, a2, b1);
            let d4 = orientation(a1, a2, b2);
            ((d1 > 1e-12 && d2 < -1e-12) || (d1 < -1e-12 && d2 > 1e-12))
                && ((d3 > 1e-12 && d4 < -1e-12) || (d3 < -1e-12 && d4 > 1e-12))
        })
    })
}

/// True when the two geometries share at least one point.
pub fn intersects(a: &Geometry, b: &Geometry) -> bool {
    simple_parts(a).iter().any(|part_a| {
        simple_parts(b)
            .iter()
            .any(|part_b| simple_intersects(part_a, part_b))
    })
}

/// True when `a` covers every point of `b`; boundaries count as covered.
pub fn covers(a: &Geometry, b: &Geometry) -> bool {
    let parts_a = simple_parts(a);
    simple_parts(b).iter().all(|part_b| {
        parts_a
            .iter()
            .any(|part_a| simple_covers(part_a, part_b))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(x0: f64, y0: f64, x1: f64, y1: f64) -> Geometry {
        Geometry::Polygon(Polygon(vec![LinearRing(vec![
            Point::new(x0, y0),
            Point::new(x1, y0),
            Point::new(x1, y1),
            Point::new(x0, y1),
        ])]))
    }

    #[test]
    fn wkt_round_figures() {
        let point = Geometry::Point(Point::new(1.0, 2.5));
        assert_eq!(point.as_wkt(), "POINT (1.000000 2.500000)");

        let polygon = square(0.0, 0.0, 1.0, 1.0);
        assert_eq!(
            polygon.as_wkt(),
            "POLYGON ((0.000000 0.000000, 1.000000 0.000000, 1.000000 1.000000, \
             0.000000 1.000000, 0.000000 0.000000))"
        );
    }

    #[test]
    fn geojson_round_trip() {
        let polygon = square(0.0, 0.0, 2.0, 2.0);
        let geojson = polygon.as_geojson();
        assert_eq!(geojson["type"], "Polygon");
        let decoded = Geometry::from_geojson(&geojson).unwrap();
        assert_eq!(decoded, polygon);
    }

    #[test]
    fn ewkb_round_trip_with_srid() {
        let geometries = vec![
            Geometry::Point(Point::new(4.0, 52.0)),
            Geometry::LineString(LineString(vec![Point::new(0.0, 0.0), Point::new(1.0, 1.0)])),
            square(0.0, 0.0, 1.0, 1.0),
            Geometry::MultiPoint(MultiPoint(vec![Point::new(0.0, 0.0), Point::new(1.0, 2.0)])),
            Geometry::MultiPolygon(MultiPolygon(vec![
                Polygon(vec![LinearRing(vec![
                    Point::new(0.0, 0.0),
                    Point::new(1.0, 0.0),
                    Point::new(1.0, 1.0),
                ])]),
            ])),
        ];
        for geometry in geometries {
            let ewkb = encode_ewkb(&geometry);
            // endianness byte + tagged type with the SRID flag
            assert_eq!(ewkb[0], 1);
            let decoded = decode_ewkb(&ewkb).unwrap();
            assert_eq!(decoded, geometry);
        }
    }

    #[test]
    fn hexewkb_embeds_srid_prefix() {
        let hexewkb = encode_hexewkb(&Geometry::Point(Point::new(0.0, 0.0)));
        // 01 (little endian), 01000020 (point | srid flag), E6100000 (4326)
        assert!(hexewkb.starts_with("0101000020E6100000"));
        assert_eq!(
            decode_hexewkb(&hexewkb).unwrap(),
            Geometry::Point(Point::new(0.0, 0.0))
        );
    }

    #[test]
    fn point_wrap_normalizes_longitude() {
        assert_eq!(Point::new(190.0, 10.0).wrap(), Point::new(-170.0, 10.0));
        assert_eq!(Point::new(-190.0, 10.0).wrap(), Point::new(170.0, 10.0));
        assert_eq!(Point::new(170.0, 10.0).wrap(), Point::new(170.0, 10.0));
    }

    #[test]
    fn line_wrap_splits_at_dateline() {
        let line = LineString(vec![Point::new(170.0, 0.0), Point::new(190.0, 0.0)]);
        match Geometry::LineString(line).wrap() {
            Geometry::MultiLineString(lines) => {
                assert_eq!(lines.0.len(), 2);
                assert_eq!(lines.0[0].0.last(), Some(&Point::new(180.0, 0.0)));
                assert_eq!(lines.0[1].0.first(), Some(&Point::new(-180.0, 0.0)));
            }
            other => panic!("expected multi line string, got {}", other),
        }
    }

    #[test]
    fn polygon_wrap_splits_at_dateline() {
        let polygon = Polygon(vec![LinearRing(vec![
            Point::new(170.0, -10.0),
            Point::new(190.0, -10.0),
            Point::new(190.0, 10.0),
            Point::new(170.0, 10.0),
        ])]);
        match Geometry::Polygon(polygon).wrap() {
            Geometry::MultiPolygon(polygons) => assert_eq!(polygons.0.len(), 2),
            other => panic!("expected multi polygon, got {}", other),
        }
    }

    #[test]
    fn clockwise_polygon_becomes_complement() {
        let polygon = Polygon(vec![LinearRing(vec![
            Point::new(0.0, 0.0),
            Point::new(0.0, 10.0),
            Point::new(10.0, 10.0),
            Point::new(10.0, 0.0),
        ])]);
        match Geometry::Polygon(polygon).wrap() {
            Geometry::Polygon(wrapped) => {
                assert_eq!(wrapped.0.len(), 2);
                assert_eq!(wrapped.0[0].0[0], Point::new(-180.0, -90.0));
            }
            other => panic!("expected polygon with hole, got {}", other),
        }
    }

    #[test]
    fn polar_polygon_gets_polar_edge() {
        // A ring around the north pole, crossing the dateline twice.
        let polygon = Polygon(vec![LinearRing(vec![
            Point::new(0.0, 80.0),
            Point::new(90.0, 80.0),
            Point::new(180.0, 80.0),
            Point::new(270.0, 80.0),
        ])]);
        match Geometry::Polygon(polygon).wrap() {
            Geometry::Polygon(wrapped) => {
                let points = &wrapped.0[0].0;
                assert!(points.contains(&Point::new(180.0, 90.0)));
                assert!(points.contains(&Point::new(-180.0, 90.0)));
            }
            other => panic!("expected polygon, got {}", other),
        }
    }

    #[test]
    fn covers_and_intersects() {
        let outer = square(0.0, 0.0, 10.0, 10.0);
        let inner = square(2.0, 2.0, 4.0, 4.0);
        let overlapping = square(8.0, 8.0, 12.0, 12.0);
        let distant = square(20.0, 20.0, 22.0, 22.0);

        assert!(covers(&outer, &inner));
        assert!(!covers(&inner, &outer));
        assert!(!covers(&outer, &overlapping));

        assert!(intersects(&outer, &inner));
        assert!(intersects(&outer, &overlapping));
        assert!(!intersects(&outer, &distant));

        let point = Geometry::Point(Point::new(5.0, 5.0));
        assert!(covers(&outer, &point));
        assert!(intersects(&point, &outer));
        assert!(!covers(&inner, &point));
    }

    #[test]
    fn holes_exclude_points() {
        let with_hole = Geometry::Polygon(Polygon(vec![
            LinearRing(vec![
                Point::new(0.0, 0.0),
                Point::new(10.0, 0.0),
                Point::new(10.0, 10.0),
                Point::new(0.0, 10.0),
            ]),
            LinearRing(vec![
                Point::new(4.0, 4.0),
                Point::new(6.0, 4.0),
                Point::new(6.0, 6.0),
                Point::new(4.0, 6.0),
            ]),
        ]));
        assert!(!covers(&with_hole, &Geometry::Point(Point::new(5.0, 5.0))));
        assert!(covers(&with_hole, &Geometry::Point(Point::new(1.0, 1.0))));
    }
}
