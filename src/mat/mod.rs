//! Writer for MATLAB 5.0 level-5 containers.
//!
//! A file is a 128-byte text header followed by a sequence of `miMATRIX`
//! elements, each composed of Flags, Dimensions, Name and Data
//! sub-elements aligned to 8 bytes. [`MatObj`] collects matrices and then
//! serves the file as a byte stream without ever assembling it in memory:
//! numeric payloads are handed out straight from the owned arrays, only
//! the per-matrix headers (and nested containers) are materialized.

use std::io;
use std::time::{SystemTime, UNIX_EPOCH};

use zerocopy::{Immutable, IntoBytes};

/// Primitive type ids.
const MI_INT8: u32 = 1;
const MI_UINT8: u32 = 2;
const MI_INT16: u32 = 3;
const MI_UINT16: u32 = 4;
const MI_INT32: u32 = 5;
const MI_UINT32: u32 = 6;
const MI_SINGLE: u32 = 7;
const MI_DOUBLE: u32 = 9;
const MI_MATRIX: u32 = 14;

/// Array class ids.
const MX_CELL_CLASS: u8 = 1;
const MX_STRUCT_CLASS: u8 = 2;
const MX_DOUBLE_CLASS: u8 = 6;
const MX_SINGLE_CLASS: u8 = 7;
const MX_INT8_CLASS: u8 = 8;
const MX_UINT8_CLASS: u8 = 9;
const MX_INT16_CLASS: u8 = 10;
const MX_UINT16_CLASS: u8 = 11;
const MX_INT32_CLASS: u8 = 12;
const MX_UINT32_CLASS: u8 = 13;

const MAT_HEADER: &str = "MATLAB 5.0 MAT-file, Platform: GLNXA64, Created on: ";
const MAT_ENDIAN: u16 = 0x4D49;

/// Scalar element types a numeric matrix can hold.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScalarKind {
	I8,
	U8,
	I16,
	U16,
	I32,
	U32,
	F32,
	F64,
}

impl ScalarKind {
	fn mi_type(self) -> u32 {
		match self {
			ScalarKind::I8 => MI_INT8,
			ScalarKind::U8 => MI_UINT8,
			ScalarKind::I16 => MI_INT16,
			ScalarKind::U16 => MI_UINT16,
			ScalarKind::I32 => MI_INT32,
			ScalarKind::U32 => MI_UINT32,
			ScalarKind::F32 => MI_SINGLE,
			ScalarKind::F64 => MI_DOUBLE,
		}
	}

	fn class(self) -> u8 {
		match self {
			ScalarKind::I8 => MX_INT8_CLASS,
			ScalarKind::U8 => MX_UINT8_CLASS,
			ScalarKind::I16 => MX_INT16_CLASS,
			ScalarKind::U16 => MX_UINT16_CLASS,
			ScalarKind::I32 => MX_INT32_CLASS,
			ScalarKind::U32 => MX_UINT32_CLASS,
			ScalarKind::F32 => MX_SINGLE_CLASS,
			ScalarKind::F64 => MX_DOUBLE_CLASS,
		}
	}

	pub fn size(self) -> usize {
		match self {
			ScalarKind::I8 | ScalarKind::U8 => 1,
			ScalarKind::I16 | ScalarKind::U16 => 2,
			ScalarKind::I32 | ScalarKind::U32 | ScalarKind::F32 => 4,
			ScalarKind::F64 => 8,
		}
	}
}

/// Rust scalars that map onto a [`ScalarKind`].
pub trait MatScalar: IntoBytes + Immutable + Copy {
	const KIND: ScalarKind;
}

macro_rules! mat_scalar {
	($($ty:ty => $kind:ident,)*) => {
		$(impl MatScalar for $ty {
			const KIND: ScalarKind = ScalarKind::$kind;
		})*
	};
}

mat_scalar! {
	i8 => I8,
	u8 => U8,
	i16 => I16,
	u16 => U16,
	i32 => I32,
	u32 => U32,
	f32 => F32,
	f64 => F64,
}

/// Value of a matrix: numeric payload, cell array or structure.
///
/// Children of containers are optional; an absent child serializes as an
/// empty double matrix.
#[derive(Clone, Debug)]
pub enum MatValue {
	Num(ScalarKind, Vec<u8>),
	Cell(Vec<Option<MatValue>>),
	Struct {
		fields: Vec<String>,
		/// `fields.len()` entries per array element, element-major in
		/// column-major element order.
		elements: Vec<Option<MatValue>>,
	},
}

impl MatValue {
	fn class(&self) -> u8 {
		match self {
			MatValue::Num(kind, _) => kind.class(),
			MatValue::Cell(_) => MX_CELL_CLASS,
			MatValue::Struct { .. } => MX_STRUCT_CLASS,
		}
	}
}

fn pad8(n: usize) -> usize {
	(8 - n % 8) % 8
}

fn put_tag(out: &mut Vec<u8>, mi_type: u32, nbytes: usize) {
	out.extend_from_slice(&mi_type.to_ne_bytes());
	out.extend_from_slice(&(nbytes as u32).to_ne_bytes());
}

/// Maximum stored length of a structure field name, terminator included.
const FIELD_NAME_LEN: usize = 32;

/// One named matrix of a container.
#[derive(Clone, Debug)]
pub struct MatArray {
	name: String,
	rows: u32,
	cols: u32,
	value: MatValue,
}

impl MatArray {
	/// A numeric matrix in column-major element order.
	pub fn num<T: MatScalar>(name: &str, rows: u32, cols: u32, data: &[T]) -> MatArray {
		assert_eq!(data.len(), rows as usize * cols as usize);
		MatArray {
			name: name.to_string(),
			rows,
			cols,
			value: MatValue::Num(T::KIND, data.as_bytes().to_vec()),
		}
	}

	/// A numeric column vector.
	pub fn vector<T: MatScalar>(name: &str, data: &[T]) -> MatArray {
		Self::num(name, data.len() as u32, 1, data)
	}

	/// A numeric 1×1 matrix.
	pub fn scalar<T: MatScalar>(name: &str, value: T) -> MatArray {
		Self::num(name, 1, 1, &[value])
	}

	/// An empty cell array.
	pub fn cell(name: &str, rows: u32, cols: u32) -> MatArray {
		MatArray {
			name: name.to_string(),
			rows,
			cols,
			value: MatValue::Cell(vec![None; rows as usize * cols as usize]),
		}
	}

	/// An empty structure array with the given field names.
	pub fn structure(name: &str, rows: u32, cols: u32, fields: &[&str]) -> MatArray {
		MatArray {
			name: name.to_string(),
			rows,
			cols,
			value: MatValue::Struct {
				fields: fields.iter().map(|f| f.to_string()).collect(),
				elements: vec![None; rows as usize * cols as usize * fields.len()],
			},
		}
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn dims(&self) -> (u32, u32) {
		(self.rows, self.cols)
	}

	/// Grow a container so that element `(row, col)` exists. Dimensions
	/// widen monotonically, existing children keep their positions.
	pub fn reserve_index(&mut self, row: u32, col: u32) {
		let new_rows = self.rows.max(row + 1);
		let new_cols = self.cols.max(col + 1);
		if new_rows == self.rows && new_cols == self.cols {
			return;
		}

		let per_element = match &self.value {
			MatValue::Cell(_) => 1,
			MatValue::Struct { fields, .. } => fields.len(),
			MatValue::Num(..) => panic!("numeric matrices do not grow"),
		};

		let remap = |old: &mut Vec<Option<MatValue>>, rows: usize, new_rows: usize, count: usize| {
			let mut grown = vec![None; count];
			for (index, child) in old.drain(..).enumerate() {
				let element = index / per_element;
				let field = index % per_element;
				let (i, j) = (element % rows, element / rows);
				grown[(i + new_rows * j) * per_element + field] = child;
			}
			*old = grown;
		};

		let count = new_rows as usize * new_cols as usize * per_element;
		match &mut self.value {
			MatValue::Cell(children) => {
				remap(children, self.rows as usize, new_rows as usize, count)
			}
			MatValue::Struct { elements, .. } => {
				remap(elements, self.rows as usize, new_rows as usize, count)
			}
			MatValue::Num(..) => unreachable!(),
		}
		self.rows = new_rows;
		self.cols = new_cols;
	}

	/// Place a child into a cell array, growing it as needed.
	pub fn set_cell(&mut self, row: u32, col: u32, value: MatValue) {
		self.reserve_index(row, col);
		let index = (row + self.rows * col) as usize;
		match &mut self.value {
			MatValue::Cell(children) => children[index] = Some(value),
			_ => panic!("not a cell array"),
		}
	}

	/// Place a child into a structure field, growing the array as needed.
	pub fn set_field(&mut self, field: &str, row: u32, col: u32, value: MatValue) {
		self.reserve_index(row, col);
		let rows = self.rows;
		match &mut self.value {
			MatValue::Struct { fields, elements } => {
				let f = fields
					.iter()
					.position(|name| name == field)
					.expect("unknown structure field");
				let element = (row + rows * col) as usize;
				elements[element * fields.len() + f] = Some(value);
			}
			_ => panic!("not a structure"),
		}
	}

	/// Raw numeric payload served by the streaming reader. Containers are
	/// fully materialized in their header instead.
	fn payload(&self) -> &[u8] {
		match &self.value {
			MatValue::Num(_, bytes) => bytes,
			_ => &[],
		}
	}

	/// Serialize the complete `miMATRIX` element.
	fn write_element(&self, out: &mut Vec<u8>) {
		write_element(out, &self.name, self.rows, self.cols, &self.value);
	}

	/// Header bytes, whether the payload is streamed separately, and the
	/// trailing padding of the payload.
	fn freeze(&self) -> Segment {
		match &self.value {
			MatValue::Num(kind, bytes) => {
				let name_sub = 8 + self.name.len() + pad8(self.name.len());
				let padding = pad8(bytes.len());
				let content = 16 + 16 + name_sub + 8 + bytes.len() + padding;

				let mut header = Vec::with_capacity(8 + content - bytes.len() - padding);
				put_tag(&mut header, MI_MATRIX, content);
				write_flags(&mut header, self.value.class());
				write_dims(&mut header, self.rows, self.cols);
				write_name(&mut header, &self.name);
				put_tag(&mut header, kind.mi_type(), bytes.len());

				Segment {
					header,
					streamed_data: true,
					padding,
				}
			}
			_ => {
				let mut header = Vec::new();
				self.write_element(&mut header);
				Segment {
					header,
					streamed_data: false,
					padding: 0,
				}
			}
		}
	}
}

fn write_flags(out: &mut Vec<u8>, class: u8) {
	put_tag(out, MI_UINT32, 8);
	out.extend_from_slice(&(class as u32).to_ne_bytes());
	out.extend_from_slice(&0u32.to_ne_bytes());
}

fn write_dims(out: &mut Vec<u8>, rows: u32, cols: u32) {
	put_tag(out, MI_INT32, 8);
	out.extend_from_slice(&(rows as i32).to_ne_bytes());
	out.extend_from_slice(&(cols as i32).to_ne_bytes());
}

fn write_name(out: &mut Vec<u8>, name: &str) {
	put_tag(out, MI_INT8, name.len());
	out.extend_from_slice(name.as_bytes());
	out.extend_from_slice(&[0u8; 8][..pad8(name.len())]);
}

/// Serialize one full element, recursing into containers. Nested
/// children carry an empty name.
fn write_element(out: &mut Vec<u8>, name: &str, rows: u32, cols: u32, value: &MatValue) {
	let mut body = Vec::new();
	write_flags(&mut body, value.class());
	write_dims(&mut body, rows, cols);
	write_name(&mut body, name);

	match value {
		MatValue::Num(kind, bytes) => {
			put_tag(&mut body, kind.mi_type(), bytes.len());
			body.extend_from_slice(bytes);
			body.extend_from_slice(&[0u8; 8][..pad8(bytes.len())]);
		}
		MatValue::Cell(children) => {
			for child in children {
				write_child(&mut body, child);
			}
		}
		MatValue::Struct { fields, elements } => {
			// Field name length, in the small data element format.
			body.extend_from_slice(&((4u32 << 16) | MI_INT32).to_ne_bytes());
			body.extend_from_slice(&(FIELD_NAME_LEN as i32).to_ne_bytes());

			// Field names, each padded to the fixed length.
			put_tag(&mut body, MI_INT8, fields.len() * FIELD_NAME_LEN);
			for field in fields {
				let mut padded = [0u8; FIELD_NAME_LEN];
				let len = field.len().min(FIELD_NAME_LEN - 1);
				padded[..len].copy_from_slice(&field.as_bytes()[..len]);
				body.extend_from_slice(&padded);
			}

			for element in elements {
				write_child(&mut body, element);
			}
		}
	}

	put_tag(out, MI_MATRIX, body.len());
	out.extend_from_slice(&body);
}

/// An absent child serializes as an empty double matrix; present children
/// are written as column vectors.
fn write_child(out: &mut Vec<u8>, child: &Option<MatValue>) {
	match child {
		Some(value @ MatValue::Num(kind, bytes)) => {
			let rows = (bytes.len() / kind.size()) as u32;
			write_element(out, "", rows, 1.min(rows), value);
		}
		Some(value @ MatValue::Cell(children)) => {
			let rows = children.len() as u32;
			write_element(out, "", rows, 1.min(rows), value);
		}
		Some(
			value @ MatValue::Struct {
				fields, elements, ..
			},
		) => {
			let rows = if fields.is_empty() {
				0
			} else {
				(elements.len() / fields.len()) as u32
			};
			write_element(out, "", rows, 1.min(rows), value);
		}
		None => {
			write_element(out, "", 0, 0, &MatValue::Num(ScalarKind::F64, Vec::new()));
		}
	}
}

struct Segment {
	header: Vec<u8>,
	/// Whether the matrix payload is served from the owning array.
	streamed_data: bool,
	padding: usize,
}

/// A complete container, readable as a byte stream.
///
/// `get_bytes` serves the file header, then for each matrix its header,
/// payload and padding, keeping a cursor across calls so the consumer can
/// pull arbitrary chunk sizes.
pub struct MatObj {
	file_header: [u8; 128],
	arrays: Vec<MatArray>,
	segments: Vec<Segment>,
	ptr: usize,
}

impl MatObj {
	pub fn new() -> Self {
		let mut header = [0x20u8; 128];
		let stamp = SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.map(|d| d.as_secs())
			.unwrap_or(0);
		let text = format!("{MAT_HEADER}{stamp}");
		let len = text.len().min(116);
		header[..len].copy_from_slice(&text.as_bytes()[..len]);
		header[124] = 0x00;
		header[125] = 0x01;
		header[126..128].copy_from_slice(&MAT_ENDIAN.to_ne_bytes());

		Self {
			file_header: header,
			arrays: Vec::new(),
			segments: Vec::new(),
			ptr: 0,
		}
	}

	/// Append a matrix to the container.
	pub fn add_matrix(&mut self, array: MatArray) {
		self.segments.push(array.freeze());
		self.arrays.push(array);
	}

	/// Total size of the serialized file in bytes.
	pub fn total_size(&self) -> usize {
		let mut size = 128;
		for (segment, array) in self.segments.iter().zip(&self.arrays) {
			size += segment.header.len() + segment.padding;
			if segment.streamed_data {
				size += array.payload().len();
			}
		}
		size
	}

	/// Rewind the stream cursor.
	pub fn reset(&mut self) {
		self.ptr = 0;
	}

	/// Copy up to `buf.len()` bytes of the serialized file into `buf`,
	/// starting at the cursor. Returns the number of bytes written, 0 at
	/// end of stream.
	pub fn get_bytes(&mut self, buf: &mut [u8]) -> usize {
		if buf.is_empty() {
			return 0;
		}

		let n = match self.locate(self.ptr) {
			Cursor::FileHeader(off) => copy_chunk(buf, &self.file_header[off..]),
			Cursor::SegHeader(i, off) => copy_chunk(buf, &self.segments[i].header[off..]),
			Cursor::SegData(i, off) => copy_chunk(buf, &self.arrays[i].payload()[off..]),
			Cursor::SegPadding(left) => {
				let n = left.min(buf.len());
				buf[..n].fill(0);
				n
			}
			Cursor::End => 0,
		};
		self.ptr += n;
		n
	}

	/// Map a file offset to the part of the container it falls into.
	fn locate(&self, ptr: usize) -> Cursor {
		if ptr < 128 {
			return Cursor::FileHeader(ptr);
		}

		let mut base = 128;
		for (i, (segment, array)) in self.segments.iter().zip(&self.arrays).enumerate() {
			let data_len = if segment.streamed_data {
				array.payload().len()
			} else {
				0
			};
			let seg_len = segment.header.len() + data_len + segment.padding;
			if ptr < base + seg_len {
				let local = ptr - base;
				return if local < segment.header.len() {
					Cursor::SegHeader(i, local)
				} else if local < segment.header.len() + data_len {
					Cursor::SegData(i, local - segment.header.len())
				} else {
					Cursor::SegPadding(seg_len - local)
				};
			}
			base += seg_len;
		}
		Cursor::End
	}
}

enum Cursor {
	FileHeader(usize),
	SegHeader(usize, usize),
	SegData(usize, usize),
	SegPadding(usize),
	End,
}

fn copy_chunk(buf: &mut [u8], chunk: &[u8]) -> usize {
	let n = chunk.len().min(buf.len());
	buf[..n].copy_from_slice(&chunk[..n]);
	n
}

impl Default for MatObj {
	fn default() -> Self {
		Self::new()
	}
}

impl io::Read for MatObj {
	fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
		Ok(self.get_bytes(buf))
	}
}

#[cfg(test)]
mod tests {
	use std::io::Read;

	use super::*;

	fn drain(obj: &mut MatObj, chunk: usize) -> Vec<u8> {
		let mut out = Vec::new();
		let mut buf = vec![0u8; chunk];
		loop {
			let n = obj.get_bytes(&mut buf);
			if n == 0 {
				break;
			}
			out.extend_from_slice(&buf[..n]);
		}
		out
	}

	#[test]
	fn header_terminates_with_version_and_endian() {
		let obj = MatObj::new();
		assert_eq!(obj.total_size(), 128);
		assert_eq!(obj.file_header[124], 0x00);
		assert_eq!(obj.file_header[125], 0x01);
		assert_eq!(
			u16::from_ne_bytes([obj.file_header[126], obj.file_header[127]]),
			0x4D49
		);
	}

	#[test]
	fn numeric_matrix_layout() {
		let mut obj = MatObj::new();
		obj.add_matrix(MatArray::vector("ch", &[1i8, -2, 5]));

		// Element: tag 8 + flags 16 + dims 16 + name ("ch" → 8+8) + data
		// tag 8 + 3 bytes payload + 5 padding.
		assert_eq!(obj.total_size(), 128 + 8 + 16 + 16 + 16 + 8 + 3 + 5);

		let bytes = drain(&mut obj, 7);
		assert_eq!(bytes.len(), obj.total_size());
		// Total size is 8-aligned.
		assert_eq!((bytes.len() - 128) % 8, 0);

		// The element tag sits right after the file header.
		assert_eq!(u32::from_ne_bytes(bytes[128..132].try_into().unwrap()), MI_MATRIX);
		let content = u32::from_ne_bytes(bytes[132..136].try_into().unwrap()) as usize;
		assert_eq!(128 + 8 + content, bytes.len());
	}

	#[test]
	fn chunk_size_does_not_change_the_stream() {
		let build = || {
			let mut obj = MatObj::new();
			obj.add_matrix(MatArray::vector("stoptime", &[1.0f64, 2.0, 3.0]));
			obj.add_matrix(MatArray::vector("retrig", &[7u32, 8, 9]));
			obj
		};
		let a = drain(&mut build(), 1);
		let b = drain(&mut build(), 4096);
		assert_eq!(a, b);
	}

	#[test]
	fn read_trait_matches_get_bytes() {
		let mut obj = MatObj::new();
		obj.add_matrix(MatArray::scalar("tbin", 80.955f64));
		let expected = drain(&mut obj, 16);

		let mut obj2 = MatObj::new();
		obj2.add_matrix(MatArray::scalar("tbin", 80.955f64));
		let mut actual = Vec::new();
		obj2.read_to_end(&mut actual).unwrap();
		assert_eq!(actual, expected);
	}

	#[test]
	fn struct_with_nested_children_serializes() {
		let mut st = MatArray::structure("times", 1, 1, &["begin", "duration"]);
		st.set_field("begin", 0, 0, MatValue::Num(ScalarKind::F64, 1.0f64.as_bytes().to_vec()));
		st.set_field(
			"duration",
			0,
			0,
			MatValue::Num(ScalarKind::F64, 2.0f64.as_bytes().to_vec()),
		);

		let mut obj = MatObj::new();
		obj.add_matrix(st);
		let bytes = drain(&mut obj, 64);
		assert_eq!(bytes.len(), obj.total_size());
		assert_eq!((bytes.len() - 128) % 8, 0);
	}

	#[test]
	fn cell_growth_widens_both_dimensions() {
		let mut cell = MatArray::cell("c", 1, 1);
		cell.set_cell(0, 0, MatValue::Num(ScalarKind::U8, vec![1]));
		cell.set_cell(2, 3, MatValue::Num(ScalarKind::U8, vec![2]));
		assert_eq!(cell.dims(), (3, 4));

		// The original child kept its position.
		match &cell.value {
			MatValue::Cell(children) => {
				assert!(matches!(&children[0], Some(MatValue::Num(ScalarKind::U8, v)) if v == &vec![1]));
				let index = (2 + 3 * 3) as usize;
				assert!(matches!(&children[index], Some(MatValue::Num(ScalarKind::U8, v)) if v == &vec![2]));
			}
			_ => unreachable!(),
		}
	}

	#[test]
	fn absent_cell_children_become_empty_doubles() {
		let cell = MatArray::cell("c", 2, 1);
		let mut obj = MatObj::new();
		obj.add_matrix(cell);
		let bytes = drain(&mut obj, 32);
		// Two empty double matrices of 56 bytes each inside the cell.
		assert_eq!(bytes.len(), 128 + 8 + 16 + 16 + 16 + 2 * 56);
	}
}
