//! Hierarchical, self-describing tag trees used for chunk payloads and
//! world metadata. Binary layout is big-endian throughout; compound
//! children are name-keyed and unordered.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::io::{self, Read, Write};
use strata_common::StorageError;

/// Extraction of a tag as the wrong kind. Surfaces as a corrupt-format
/// condition at decode boundaries instead of an unchecked cast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeMismatch {
    pub expected: &'static str,
    pub found: &'static str,
}

impl fmt::Display for TypeMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "expected {} tag, found {}", self.expected, self.found)
    }
}

impl Error for TypeMismatch {}

impl From<TypeMismatch> for StorageError {
    fn from(err: TypeMismatch) -> Self {
        StorageError::CorruptFormat(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Tag {
    End,
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    ByteArray(Vec<i8>),
    String(String),
    List(Vec<Tag>),
    Compound(HashMap<String, Tag>),
    IntArray(Vec<i32>),
    LongArray(Vec<i64>),
}

impl Tag {
    pub fn get_type_id(&self) -> u8 {
        match self {
            Tag::End => 0,
            Tag::Byte(_) => 1,
            Tag::Short(_) => 2,
            Tag::Int(_) => 3,
            Tag::Long(_) => 4,
            Tag::Float(_) => 5,
            Tag::Double(_) => 6,
            Tag::ByteArray(_) => 7,
            Tag::String(_) => 8,
            Tag::List(_) => 9,
            Tag::Compound(_) => 10,
            Tag::IntArray(_) => 11,
            Tag::LongArray(_) => 12,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Tag::End => "end",
            Tag::Byte(_) => "byte",
            Tag::Short(_) => "short",
            Tag::Int(_) => "int",
            Tag::Long(_) => "long",
            Tag::Float(_) => "float",
            Tag::Double(_) => "double",
            Tag::ByteArray(_) => "byte-array",
            Tag::String(_) => "string",
            Tag::List(_) => "list",
            Tag::Compound(_) => "compound",
            Tag::IntArray(_) => "int-array",
            Tag::LongArray(_) => "long-array",
        }
    }

    pub fn read<R: Read>(reader: &mut R) -> io::Result<(String, Tag)> {
        let type_id = reader.read_u8()?;
        if type_id == 0 {
            return Ok(("".to_owned(), Tag::End));
        }

        let name_length = reader.read_u16::<BigEndian>()?;
        let mut name_bytes = vec![0u8; name_length as usize];
        reader.read_exact(&mut name_bytes)?;
        let name = String::from_utf8(name_bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let tag = Tag::read_payload(reader, type_id)?;
        Ok((name, tag))
    }

    fn read_payload<R: Read>(reader: &mut R, type_id: u8) -> io::Result<Tag> {
        match type_id {
            0 => Ok(Tag::End),
            1 => Ok(Tag::Byte(reader.read_i8()?)),
            2 => Ok(Tag::Short(reader.read_i16::<BigEndian>()?)),
            3 => Ok(Tag::Int(reader.read_i32::<BigEndian>()?)),
            4 => Ok(Tag::Long(reader.read_i64::<BigEndian>()?)),
            5 => Ok(Tag::Float(reader.read_f32::<BigEndian>()?)),
            6 => Ok(Tag::Double(reader.read_f64::<BigEndian>()?)),
            7 => {
                let length = read_array_length(reader)?;
                let mut bytes = vec![0u8; length];
                reader.read_exact(&mut bytes)?;
                Ok(Tag::ByteArray(bytes.into_iter().map(|b| b as i8).collect()))
            }
            8 => {
                let length = reader.read_u16::<BigEndian>()?;
                let mut bytes = vec![0u8; length as usize];
                reader.read_exact(&mut bytes)?;
                String::from_utf8(bytes)
                    .map(Tag::String)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
            }
            9 => {
                let list_type = reader.read_u8()?;
                let length = read_array_length(reader)?;
                let mut list = Vec::with_capacity(length);
                for _ in 0..length {
                    list.push(Tag::read_payload(reader, list_type)?);
                }
                Ok(Tag::List(list))
            }
            10 => {
                let mut compound = HashMap::new();
                loop {
                    let (name, tag) = Tag::read(reader)?;
                    if let Tag::End = tag {
                        break;
                    }
                    compound.insert(name, tag);
                }
                Ok(Tag::Compound(compound))
            }
            11 => {
                let length = read_array_length(reader)?;
                let mut ints = Vec::with_capacity(length);
                for _ in 0..length {
                    ints.push(reader.read_i32::<BigEndian>()?);
                }
                Ok(Tag::IntArray(ints))
            }
            12 => {
                let length = read_array_length(reader)?;
                let mut longs = Vec::with_capacity(length);
                for _ in 0..length {
                    longs.push(reader.read_i64::<BigEndian>()?);
                }
                Ok(Tag::LongArray(longs))
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Invalid tag type: {}", type_id),
            )),
        }
    }

    pub fn write<W: Write>(&self, writer: &mut W, name: &str) -> io::Result<()> {
        writer.write_u8(self.get_type_id())?;

        if !matches!(self, Tag::End) {
            writer.write_u16::<BigEndian>(name.len() as u16)?;
            writer.write_all(name.as_bytes())?;
        }

        self.write_payload(writer)
    }

    fn write_payload<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        match self {
            Tag::End => Ok(()),
            Tag::Byte(v) => writer.write_i8(*v),
            Tag::Short(v) => writer.write_i16::<BigEndian>(*v),
            Tag::Int(v) => writer.write_i32::<BigEndian>(*v),
            Tag::Long(v) => writer.write_i64::<BigEndian>(*v),
            Tag::Float(v) => writer.write_f32::<BigEndian>(*v),
            Tag::Double(v) => writer.write_f64::<BigEndian>(*v),
            Tag::ByteArray(v) => {
                writer.write_i32::<BigEndian>(v.len() as i32)?;
                for &b in v {
                    writer.write_i8(b)?;
                }
                Ok(())
            }
            Tag::String(v) => {
                writer.write_u16::<BigEndian>(v.len() as u16)?;
                writer.write_all(v.as_bytes())
            }
            Tag::List(v) => {
                if v.is_empty() {
                    writer.write_u8(0)?; // TAG_End for empty lists
                } else {
                    writer.write_u8(v[0].get_type_id())?;
                }
                writer.write_i32::<BigEndian>(v.len() as i32)?;
                for tag in v {
                    tag.write_payload(writer)?;
                }
                Ok(())
            }
            Tag::Compound(v) => {
                // Children write in name order so identical trees always
                // serialize to identical bytes.
                let mut names: Vec<&String> = v.keys().collect();
                names.sort_unstable();
                for name in names {
                    v[name].write(writer, name)?;
                }
                Tag::End.write(writer, "")?;
                Ok(())
            }
            Tag::IntArray(v) => {
                writer.write_i32::<BigEndian>(v.len() as i32)?;
                for &i in v {
                    writer.write_i32::<BigEndian>(i)?;
                }
                Ok(())
            }
            Tag::LongArray(v) => {
                writer.write_i32::<BigEndian>(v.len() as i32)?;
                for &l in v {
                    writer.write_i64::<BigEndian>(l)?;
                }
                Ok(())
            }
        }
    }

    pub fn as_compound(&self) -> Option<&HashMap<String, Tag>> {
        match self {
            Tag::Compound(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&Vec<Tag>> {
        match self {
            Tag::List(list) => Some(list),
            _ => None,
        }
    }

    fn mismatch(&self, expected: &'static str) -> TypeMismatch {
        TypeMismatch {
            expected,
            found: self.type_name(),
        }
    }

    pub fn try_byte(&self) -> Result<i8, TypeMismatch> {
        match self {
            Tag::Byte(v) => Ok(*v),
            other => Err(other.mismatch("byte")),
        }
    }

    pub fn try_int(&self) -> Result<i32, TypeMismatch> {
        match self {
            Tag::Int(v) => Ok(*v),
            other => Err(other.mismatch("int")),
        }
    }

    pub fn try_long(&self) -> Result<i64, TypeMismatch> {
        match self {
            Tag::Long(v) => Ok(*v),
            other => Err(other.mismatch("long")),
        }
    }

    pub fn try_string(&self) -> Result<&str, TypeMismatch> {
        match self {
            Tag::String(v) => Ok(v),
            other => Err(other.mismatch("string")),
        }
    }

    pub fn try_list(&self) -> Result<&[Tag], TypeMismatch> {
        match self {
            Tag::List(v) => Ok(v),
            other => Err(other.mismatch("list")),
        }
    }

    pub fn try_compound(&self) -> Result<&HashMap<String, Tag>, TypeMismatch> {
        match self {
            Tag::Compound(v) => Ok(v),
            other => Err(other.mismatch("compound")),
        }
    }

    pub fn try_byte_array(&self) -> Result<&[i8], TypeMismatch> {
        match self {
            Tag::ByteArray(v) => Ok(v),
            other => Err(other.mismatch("byte-array")),
        }
    }

    pub fn try_int_array(&self) -> Result<&[i32], TypeMismatch> {
        match self {
            Tag::IntArray(v) => Ok(v),
            other => Err(other.mismatch("int-array")),
        }
    }

    pub fn try_long_array(&self) -> Result<&[i64], TypeMismatch> {
        match self {
            Tag::LongArray(v) => Ok(v),
            other => Err(other.mismatch("long-array")),
        }
    }
}

fn read_array_length<R: Read>(reader: &mut R) -> io::Result<usize> {
    let length = reader.read_i32::<BigEndian>()?;
    if length < 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Negative array length: {}", length),
        ));
    }
    Ok(length as usize)
}

/// A complete named tag tree with compression transports.
pub struct TagFile {
    pub root: Tag,
    pub name: String,
}

impl TagFile {
    pub fn new(name: String, root: Tag) -> Self {
        TagFile { root, name }
    }

    pub fn read<R: Read>(reader: &mut R) -> io::Result<Self> {
        let (name, root) = Tag::read(reader)?;
        Ok(TagFile { root, name })
    }

    pub fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        self.root.write(writer, &self.name)
    }

    pub fn read_gzip<R: Read>(reader: &mut R) -> io::Result<Self> {
        let mut decoder = GzDecoder::new(reader);
        Self::read(&mut decoder)
    }

    pub fn write_gzip<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        let mut encoder = GzEncoder::new(writer, Compression::default());
        self.write(&mut encoder)?;
        encoder.finish()?;
        Ok(())
    }

    pub fn read_zlib<R: Read>(reader: &mut R) -> io::Result<Self> {
        let mut decoder = ZlibDecoder::new(reader);
        Self::read(&mut decoder)
    }

    pub fn write_zlib<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        let mut encoder = ZlibEncoder::new(writer, Compression::default());
        self.write(&mut encoder)?;
        encoder.finish()?;
        Ok(())
    }
}
