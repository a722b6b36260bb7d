//! VMDK descriptor text.
//!
//! Parses descriptor files (standalone or embedded in a sparse extent) and
//! renders the embedded descriptor of a monolithicSparse image.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Parent CID of a disk with no parent.
pub const NO_PARENT_CID: u32 = 0xffff_ffff;

/// The type of an extent line in a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorExtentType {
    Flat,
    Sparse,
    Zero,
    Vmfs,
    VmfsSparse,
    VmfsRdm,
    VmfsRaw,
}

impl DescriptorExtentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Flat => "FLAT",
            Self::Sparse => "SPARSE",
            Self::Zero => "ZERO",
            Self::Vmfs => "VMFS",
            Self::VmfsSparse => "VMFSSPARSE",
            Self::VmfsRdm => "VMFSRDM",
            Self::VmfsRaw => "VMFSRAW",
        }
    }

    /// Whether the extent line carries a file offset after the filename.
    fn has_offset(&self) -> bool {
        matches!(self, Self::Flat | Self::Vmfs | Self::VmfsRaw)
    }
}

impl FromStr for DescriptorExtentType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "FLAT" => Ok(Self::Flat),
            "SPARSE" => Ok(Self::Sparse),
            "ZERO" => Ok(Self::Zero),
            "VMFS" => Ok(Self::Vmfs),
            "VMFSSPARSE" => Ok(Self::VmfsSparse),
            "VMFSRDM" => Ok(Self::VmfsRdm),
            "VMFSRAW" => Ok(Self::VmfsRaw),
            _ => Err(Error::vmdk(format!("unknown extent type: {}", s))),
        }
    }
}

/// Access mode of an extent line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadWrite,
    ReadOnly,
    NoAccess,
}

impl Access {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReadWrite => "RW",
            Self::ReadOnly => "RDONLY",
            Self::NoAccess => "NOACCESS",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "RW" => Some(Self::ReadWrite),
            "RDONLY" => Some(Self::ReadOnly),
            "NOACCESS" => Some(Self::NoAccess),
            _ => None,
        }
    }
}

/// One extent line, e.g. `RW 838860800 FLAT "TestVM-flat.vmdk" 0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorExtent {
    pub access: Access,
    /// Size of this extent in 512-byte sectors.
    pub size_sectors: u64,
    pub extent_type: DescriptorExtentType,
    /// Extent file; `ZERO` extents have none.
    pub filename: Option<String>,
    /// Offset within the extent file in sectors.
    pub offset: u64,
}

impl fmt::Display for DescriptorExtent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}",
            self.access.as_str(),
            self.size_sectors,
            self.extent_type.as_str()
        )?;
        if let Some(filename) = &self.filename {
            write!(f, " \"{}\"", filename)?;
            if self.extent_type.has_offset() || self.offset != 0 {
                write!(f, " {}", self.offset)?;
            }
        }
        Ok(())
    }
}

/// CHS geometry recorded in the disk database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub cylinders: u64,
    pub heads: u32,
    pub sectors: u32,
}

impl Geometry {
    /// IDE-style geometry: 16 heads, 63 sectors per track, capped at 16383
    /// cylinders.
    pub fn ide(capacity_sectors: u64) -> Self {
        let heads = 16;
        let sectors = 63;
        Self {
            cylinders: (capacity_sectors / (heads as u64 * sectors as u64)).min(16383),
            heads,
            sectors,
        }
    }
}

/// Parsed VMDK descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmdkDescriptor {
    pub version: u32,
    /// Content ID for change tracking.
    pub cid: u32,
    pub parent_cid: u32,
    /// e.g. "monolithicSparse", "monolithicFlat", "streamOptimized".
    pub create_type: String,
    pub extents: Vec<DescriptorExtent>,
    /// Disk database entries keyed by full name (`ddb.adapterType`).
    pub ddb: BTreeMap<String, String>,
}

impl VmdkDescriptor {
    /// Descriptor for a single-file sparse image.
    pub fn monolithic_sparse(
        capacity_sectors: u64,
        filename: &str,
        cid: u32,
        adapter_type: &str,
        hw_version: u32,
    ) -> Self {
        let geometry = Geometry::ide(capacity_sectors);

        let mut ddb = BTreeMap::new();
        ddb.insert("ddb.adapterType".to_string(), adapter_type.to_string());
        ddb.insert(
            "ddb.geometry.cylinders".to_string(),
            geometry.cylinders.to_string(),
        );
        ddb.insert("ddb.geometry.heads".to_string(), geometry.heads.to_string());
        ddb.insert(
            "ddb.geometry.sectors".to_string(),
            geometry.sectors.to_string(),
        );
        ddb.insert("ddb.virtualHWVersion".to_string(), hw_version.to_string());

        Self {
            version: 1,
            cid,
            parent_cid: NO_PARENT_CID,
            create_type: "monolithicSparse".to_string(),
            extents: vec![DescriptorExtent {
                access: Access::ReadWrite,
                size_sectors: capacity_sectors,
                extent_type: DescriptorExtentType::Sparse,
                filename: Some(filename.to_string()),
                offset: 0,
            }],
            ddb,
        }
    }

    pub fn disk_size_sectors(&self) -> u64 {
        self.extents.iter().map(|e| e.size_sectors).sum()
    }

    pub fn disk_size_bytes(&self) -> u64 {
        self.disk_size_sectors() * 512
    }

    pub fn ddb_value(&self, key: &str) -> Option<&str> {
        self.ddb.get(key).map(String::as_str)
    }

    pub fn adapter_type(&self) -> Option<&str> {
        self.ddb_value("ddb.adapterType")
    }

    /// Geometry if all three entries are present and numeric.
    pub fn geometry(&self) -> Option<Geometry> {
        Some(Geometry {
            cylinders: self.ddb_value("ddb.geometry.cylinders")?.parse().ok()?,
            heads: self.ddb_value("ddb.geometry.heads")?.parse().ok()?,
            sectors: self.ddb_value("ddb.geometry.sectors")?.parse().ok()?,
        })
    }
}

impl fmt::Display for VmdkDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "# Disk DescriptorFile")?;
        writeln!(f, "version={}", self.version)?;
        writeln!(f, "CID={:08x}", self.cid)?;
        writeln!(f, "parentCID={:08x}", self.parent_cid)?;
        writeln!(f, "createType=\"{}\"", self.create_type)?;
        writeln!(f)?;
        writeln!(f, "# Extent description")?;
        for extent in &self.extents {
            writeln!(f, "{}", extent)?;
        }
        writeln!(f)?;
        writeln!(f, "# The Disk Data Base")?;
        writeln!(f, "#DDB")?;
        writeln!(f)?;
        for (key, value) in &self.ddb {
            writeln!(f, "{} = \"{}\"", key, value)?;
        }
        Ok(())
    }
}

impl FromStr for VmdkDescriptor {
    type Err = Error;

    fn from_str(content: &str) -> Result<Self> {
        parse_descriptor(content)
    }
}

/// Parses descriptor text. Trailing NUL padding from an embedded descriptor
/// is ignored, as are unknown non-`ddb` keys.
pub fn parse_descriptor(content: &str) -> Result<VmdkDescriptor> {
    let mut descriptor = VmdkDescriptor {
        version: 1,
        cid: 0,
        parent_cid: NO_PARENT_CID,
        create_type: String::new(),
        extents: Vec::new(),
        ddb: BTreeMap::new(),
    };

    for line in content.trim_end_matches('\0').lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let first_word = line.split_whitespace().next().unwrap_or_default();
        if let Some(access) = Access::parse(first_word) {
            descriptor.extents.push(parse_extent_line(access, line)?);
            continue;
        }

        let Some((key, value)) = parse_key_value(line) else {
            continue;
        };

        match key {
            "version" => {
                descriptor.version = value
                    .parse()
                    .map_err(|_| Error::vmdk(format!("invalid version: {}", value)))?;
            }
            "CID" => descriptor.cid = parse_hex_id("CID", value)?,
            "parentCID" => descriptor.parent_cid = parse_hex_id("parentCID", value)?,
            "createType" => descriptor.create_type = value.to_string(),
            _ if key.starts_with("ddb.") => {
                descriptor.ddb.insert(key.to_string(), value.to_string());
            }
            _ => {}
        }
    }

    Ok(descriptor)
}

fn parse_hex_id(name: &str, value: &str) -> Result<u32> {
    u32::from_str_radix(value, 16).map_err(|_| Error::vmdk(format!("invalid {}: {}", name, value)))
}

/// Splits `key=value` or `key = "value"`, unquoting the value.
fn parse_key_value(line: &str) -> Option<(&str, &str)> {
    let (key, value) = line.split_once('=')?;
    let value = value.trim();
    let value = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value);
    Some((key.trim(), value))
}

/// Splits off the next whitespace-delimited field.
fn take_field(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    let end = s.find(char::is_whitespace).unwrap_or(s.len());
    s.split_at(end)
}

/// Parses `ACCESS SIZE TYPE ["FILENAME" [OFFSET]]`.
fn parse_extent_line(access: Access, line: &str) -> Result<DescriptorExtent> {
    let (_, rest) = take_field(line);
    let (size_field, rest) = take_field(rest);
    let (type_field, rest) = take_field(rest);
    if type_field.is_empty() {
        return Err(Error::vmdk(format!("invalid extent line: {}", line)));
    }

    let size_sectors: u64 = size_field
        .parse()
        .map_err(|_| Error::vmdk(format!("invalid extent size: {}", size_field)))?;
    let extent_type: DescriptorExtentType = type_field.parse()?;

    let rest = rest.trim();
    if rest.is_empty() {
        return Ok(DescriptorExtent {
            access,
            size_sectors,
            extent_type,
            filename: None,
            offset: 0,
        });
    }

    let quoted = rest
        .strip_prefix('"')
        .ok_or_else(|| Error::vmdk(format!("expected quoted filename, got: {}", rest)))?;
    let (filename, tail) = quoted
        .split_once('"')
        .ok_or_else(|| Error::vmdk(format!("unclosed quote in: {}", rest)))?;

    let tail = tail.trim();
    let offset = if tail.is_empty() {
        0
    } else {
        tail.parse()
            .map_err(|_| Error::vmdk(format!("invalid extent offset: {}", tail)))?
    };

    Ok(DescriptorExtent {
        access,
        size_sectors,
        extent_type,
        filename: Some(filename.to_string()),
        offset,
    })
}
