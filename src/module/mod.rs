// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

mod leb128;
mod parse;

pub use crate::module::leb128::LEB128Reader;
use crate::module::parse::{
    SECTION_ID_CODE, SECTION_ID_CUSTOM, SECTION_ID_DATA, SECTION_ID_DATA_COUNT, SECTION_ID_ELEMENT,
    SECTION_ID_EXPORT, SECTION_ID_FUNCTION, SECTION_ID_GLOBAL, SECTION_ID_IMPORT,
    SECTION_ID_MEMORY, SECTION_ID_START, SECTION_ID_TABLE, SECTION_ID_TYPE,
};
use crate::bytecode::CodeBuf;
use crate::ValueType;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Errors at the opcode/immediate level of a function body.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeError {
    InvalidOpcode(u8),
    UnsupportedOpcode(u8, String),
    InvalidSignature(u32),
    MismatchedBlockStack,
    IndexOutOfRange(String),
    FailedToDecode(String),
}

impl Display for DecodeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::InvalidOpcode(opcode) => {
                write!(f, "Invalid opcode: {:#0x}", opcode)
            }
            DecodeError::UnsupportedOpcode(opcode, reason) => {
                write!(f, "Unsupported opcode: {:#0x} - {}", opcode, reason)
            }
            DecodeError::InvalidSignature(signature) => {
                write!(f, "Invalid signature: {:#0x}", signature)
            }
            DecodeError::MismatchedBlockStack => write!(f, "Mismatched block stack"),
            DecodeError::IndexOutOfRange(what) => {
                write!(f, "Index out of range: {}", what)
            }
            DecodeError::FailedToDecode(reason) => {
                write!(f, "Failed to decode: {}", reason)
            }
        }
    }
}

impl Error for DecodeError {}

/// Errors at the section level of the binary.
#[derive(Debug, Clone, PartialEq)]
pub enum LoaderError {
    InvalidMagicNumber,
    InvalidVersion,
    InvalidSectionType(u8),
    UnsupportedSectionType(SectionType),
    InvalidImportKind(u8),
    UnsupportedImportKind(u8),
    InvalidExportKind(u8),
    DecoderError(DecodeError),
}

impl Display for LoaderError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            LoaderError::InvalidMagicNumber => write!(f, "Invalid magic number"),
            LoaderError::InvalidVersion => write!(f, "Invalid version"),
            LoaderError::InvalidSectionType(t) => write!(f, "Invalid section type: {t}"),
            LoaderError::UnsupportedSectionType(t) => {
                write!(f, "Unsupported section type: {t:?}")
            }
            LoaderError::InvalidImportKind(k) => write!(f, "Invalid import kind: {k}"),
            LoaderError::UnsupportedImportKind(k) => write!(f, "Unsupported import kind: {k}"),
            LoaderError::InvalidExportKind(k) => write!(f, "Invalid export kind: {k}"),
            LoaderError::DecoderError(e) => write!(f, "Decode error: {e}"),
        }
    }
}

impl Error for LoaderError {}

impl From<DecodeError> for LoaderError {
    fn from(e: DecodeError) -> Self {
        LoaderError::DecoderError(e)
    }
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum SectionType {
    Custom = SECTION_ID_CUSTOM,
    Type = SECTION_ID_TYPE,
    Import = SECTION_ID_IMPORT,
    Function = SECTION_ID_FUNCTION,
    Table = SECTION_ID_TABLE,
    Memory = SECTION_ID_MEMORY,
    Global = SECTION_ID_GLOBAL,
    Export = SECTION_ID_EXPORT,
    Start = SECTION_ID_START,
    Element = SECTION_ID_ELEMENT,
    Code = SECTION_ID_CODE,
    Data = SECTION_ID_DATA,
    DataCount = SECTION_ID_DATA_COUNT,
}

impl SectionType {
    pub fn from_u8(value: u8) -> Result<Self, LoaderError> {
        match value {
            SECTION_ID_CUSTOM => Ok(SectionType::Custom),
            SECTION_ID_TYPE => Ok(SectionType::Type),
            SECTION_ID_IMPORT => Ok(SectionType::Import),
            SECTION_ID_FUNCTION => Ok(SectionType::Function),
            SECTION_ID_TABLE => Ok(SectionType::Table),
            SECTION_ID_MEMORY => Ok(SectionType::Memory),
            SECTION_ID_GLOBAL => Ok(SectionType::Global),
            SECTION_ID_EXPORT => Ok(SectionType::Export),
            SECTION_ID_START => Ok(SectionType::Start),
            SECTION_ID_ELEMENT => Ok(SectionType::Element),
            SECTION_ID_CODE => Ok(SectionType::Code),
            SECTION_ID_DATA => Ok(SectionType::Data),
            SECTION_ID_DATA_COUNT => Ok(SectionType::DataCount),
            _ => Err(LoaderError::InvalidSectionType(value)),
        }
    }
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExportKind {
    Function = 0x00,
    Table = 0x01,
    Memory = 0x02,
    Global = 0x03,
}

impl ExportKind {
    pub fn from_u8(value: u8) -> Result<Self, LoaderError> {
        match value {
            0x00 => Ok(ExportKind::Function),
            0x01 => Ok(ExportKind::Table),
            0x02 => Ok(ExportKind::Memory),
            0x03 => Ok(ExportKind::Global),
            _ => Err(LoaderError::InvalidExportKind(value)),
        }
    }
}

/// A function signature with its cached operand-stack footprints.
#[derive(Debug, Clone, PartialEq)]
pub struct FuncType {
    params: Vec<ValueType>,
    results: Vec<ValueType>,
    param_stack_size: u32,
    result_stack_size: u32,
}

impl FuncType {
    pub fn new(params: Vec<ValueType>, results: Vec<ValueType>) -> Self {
        let param_stack_size = params.iter().map(|t| t.stack_size()).sum();
        let result_stack_size = results.iter().map(|t| t.stack_size()).sum();
        FuncType {
            params,
            results,
            param_stack_size,
            result_stack_size,
        }
    }

    pub fn params(&self) -> &[ValueType] {
        &self.params
    }

    pub fn results(&self) -> &[ValueType] {
        &self.results
    }

    pub fn param_stack_size(&self) -> u32 {
        self.param_stack_size
    }

    pub fn result_stack_size(&self) -> u32 {
        self.result_stack_size
    }
}

/// One function of a module: its signature index, declared locals, and the
/// lowered bytecode with the stack budget the lowering pass computed for it.
/// Imported functions have an empty body.
#[derive(Debug)]
pub struct ModuleFunction {
    pub(crate) type_index: u32,
    pub(crate) locals: Vec<ValueType>,
    pub(crate) code: CodeBuf,
    pub(crate) required_stack_size: u32,
    pub(crate) required_stack_size_due_to_local: u32,
}

impl ModuleFunction {
    pub(crate) fn new(type_index: u32) -> Self {
        ModuleFunction {
            type_index,
            locals: vec![],
            code: CodeBuf::new(),
            required_stack_size: 0,
            required_stack_size_due_to_local: 0,
        }
    }

    pub fn type_index(&self) -> u32 {
        self.type_index
    }

    pub fn locals(&self) -> &[ValueType] {
        &self.locals
    }

    pub fn code(&self) -> &CodeBuf {
        &self.code
    }

    /// Maximum operand-stack depth in bytes this body ever reaches, counting
    /// the parameter and local area at the bottom of the frame.
    pub fn required_stack_size(&self) -> u32 {
        self.required_stack_size
    }

    /// Bytes of the frame taken by declared locals, excluding parameters.
    pub fn required_stack_size_due_to_local(&self) -> u32 {
        self.required_stack_size_due_to_local
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModuleImport {
    pub module: String,
    pub field: String,
    pub type_index: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModuleExport {
    pub name: String,
    pub kind: ExportKind,
    pub index: u32,
}

/// A loaded module: write-once during lowering, read-only afterwards.
/// Imported and locally declared functions share one array, imports first in
/// their declared order.
#[derive(Debug)]
pub struct Module {
    pub(crate) version: u32,
    pub(crate) types: Vec<FuncType>,
    pub(crate) functions: Vec<ModuleFunction>,
    pub(crate) imports: Vec<ModuleImport>,
    pub(crate) exports: Vec<ModuleExport>,
    pub(crate) start: Option<u32>,
}

impl Module {
    /// Decode a binary module and lower every body to internal bytecode.
    pub fn load(data: &[u8]) -> Result<Module, LoaderError> {
        parse::parse(data)
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn types(&self) -> &[FuncType] {
        &self.types
    }

    pub fn function(&self, index: u32) -> &ModuleFunction {
        &self.functions[index as usize]
    }

    pub fn function_count(&self) -> u32 {
        self.functions.len() as u32
    }

    pub fn imports(&self) -> &[ModuleImport] {
        &self.imports
    }

    pub fn exports(&self) -> &[ModuleExport] {
        &self.exports
    }

    pub fn export(&self, name: &str) -> Option<&ModuleExport> {
        self.exports.iter().find(|e| e.name == name)
    }

    pub fn start(&self) -> Option<u32> {
        self.start
    }

    /// The signature of a function by its position in the shared
    /// imports-then-defined array.
    pub fn type_of_function(&self, func_index: u32) -> &FuncType {
        &self.types[self.functions[func_index as usize].type_index as usize]
    }
}
