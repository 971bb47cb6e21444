//! Idempotent create-or-replace for stored procedures and functions.
//!
//! SQL Server versions before 2016 SP1 have no `CREATE OR ALTER`. Instead of
//! relying on it, [`program_unit_script`] produces a batch that inspects the
//! catalog at run time and executes the caller's source with either `CREATE`
//! or `ALTER` substituted for its leading `CREATE` keyword. An existing
//! object of the other kind (function instead of procedure or the reverse)
//! is dropped first.

use crate::error::{DbError, DbResult};
use crate::models::{qualify_object_name, quote_literal, split_object_name};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;

/// Leading comments, `CREATE`, the unit keyword and the (possibly
/// schema-qualified, possibly bracketed) name.
static PROGRAM_UNIT_HEADER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?is)^(?:\s+|--[^\n]*(?:\n|$)|/\*.*?\*/)*(CREATE)\s+(PROCEDURE|PROC|FUNCTION)\s+((?:\[(?:[^\]]|\]\])+\]|[\w@#$]+)(?:\s*\.\s*(?:\[(?:[^\]]|\]\])+\]|[\w@#$]+))?)",
    )
    .expect("invalid program unit regex")
});

/// Catalog `type` codes of procedures (`sys.objects.type`).
const PROCEDURE_TYPES: &[&str] = &["P", "PC"];
/// Catalog `type` codes of scalar, inline and table-valued functions.
const FUNCTION_TYPES: &[&str] = &["FN", "IF", "TF", "FS", "FT"];

/// Stored procedure or function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramUnitKind {
    Procedure,
    Function,
}

impl ProgramUnitKind {
    pub fn keyword(&self) -> &'static str {
        match self {
            Self::Procedure => "PROCEDURE",
            Self::Function => "FUNCTION",
        }
    }

    pub fn catalog_types(&self) -> &'static [&'static str] {
        match self {
            Self::Procedure => PROCEDURE_TYPES,
            Self::Function => FUNCTION_TYPES,
        }
    }

    pub fn other(&self) -> Self {
        match self {
            Self::Procedure => Self::Function,
            Self::Function => Self::Procedure,
        }
    }

    /// Kind of a `sys.objects.type` code.
    pub fn from_catalog_type(code: &str) -> Option<Self> {
        let code = code.trim();
        if PROCEDURE_TYPES.iter().any(|t| t.eq_ignore_ascii_case(code)) {
            Some(Self::Procedure)
        } else if FUNCTION_TYPES.iter().any(|t| t.eq_ignore_ascii_case(code)) {
            Some(Self::Function)
        } else {
            None
        }
    }
}

impl fmt::Display for ProgramUnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

/// Parsed header of a program unit's source text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramUnitHeader {
    pub kind: ProgramUnitKind,
    /// Name as written in the source
    pub name: String,
    /// Byte range of the leading `CREATE` keyword
    create_start: usize,
    create_end: usize,
}

impl ProgramUnitHeader {
    /// Parse `CREATE PROCEDURE|PROC|FUNCTION <name>` at the start of `source`.
    pub fn parse(source: &str) -> DbResult<Self> {
        let caps = PROGRAM_UNIT_HEADER.captures(source).ok_or_else(|| {
            DbError::invalid_input(
                "Program unit source must start with CREATE PROCEDURE or CREATE FUNCTION",
            )
        })?;
        // All three groups are mandatory in the pattern.
        let (Some(create), Some(kind), Some(name)) = (caps.get(1), caps.get(2), caps.get(3)) else {
            return Err(DbError::internal("program unit header capture missing"));
        };
        let kind = if kind.as_str().eq_ignore_ascii_case("FUNCTION") {
            ProgramUnitKind::Function
        } else {
            ProgramUnitKind::Procedure
        };
        Ok(Self {
            kind,
            name: name.as_str().to_string(),
            create_start: create.start(),
            create_end: create.end(),
        })
    }

    /// Whether the declared name refers to `expected` (schema defaults to `dbo`).
    pub fn matches_name(&self, expected: &str) -> bool {
        let (schema, name) = split_object_name(&self.name);
        let (expected_schema, expected_name) = split_object_name(expected);
        schema.eq_ignore_ascii_case(&expected_schema) && name.eq_ignore_ascii_case(&expected_name)
    }
}

fn catalog_type_list(types: &[&str]) -> String {
    types
        .iter()
        .map(|t| format!("'{}'", t))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Build the create-or-alter batch for `source`, which must declare `name`.
pub fn program_unit_script(name: &str, source: &str) -> DbResult<String> {
    let header = ProgramUnitHeader::parse(source)?;
    if !header.matches_name(name) {
        return Err(DbError::program_unit_mismatch(name, &header.name));
    }

    let qualified = qualify_object_name(name);
    let object = quote_literal(&qualified);
    let kind = header.kind;
    let other = kind.other();
    let prefix = quote_literal(&source[..header.create_start]);
    let rest = quote_literal(&source[header.create_end..]);

    Ok(format!(
        "DECLARE @existing_type NVARCHAR(2) = (SELECT RTRIM([type]) FROM sys.objects WHERE [object_id] = OBJECT_ID({object}));
DECLARE @keyword NVARCHAR(6) = N'CREATE';
IF @existing_type IS NOT NULL
BEGIN
    IF @existing_type IN ({same})
        SET @keyword = N'ALTER';
    ELSE IF @existing_type IN ({different})
        EXEC (N'DROP {other_keyword} {drop_target}');
    ELSE
    BEGIN
        RAISERROR(N'Object %s exists and is not a {keyword}', 16, 1, {object});
        RETURN;
    END
END
DECLARE @program_unit NVARCHAR(MAX) = {prefix} + @keyword + {rest};
EXEC sp_executesql @program_unit;",
        same = catalog_type_list(kind.catalog_types()),
        different = catalog_type_list(other.catalog_types()),
        other_keyword = other.keyword(),
        drop_target = qualified.replace('\'', "''"),
        keyword = kind.keyword(),
    ))
}

/// Build a batch that drops the procedure or function `name` if it exists.
pub fn drop_program_unit_script(name: &str) -> String {
    let qualified = qualify_object_name(name);
    let object = quote_literal(&qualified);
    let target = qualified.replace('\'', "''");
    format!(
        "DECLARE @existing_type NVARCHAR(2) = (SELECT RTRIM([type]) FROM sys.objects WHERE [object_id] = OBJECT_ID({object}));
IF @existing_type IN ({procedures})
    EXEC (N'DROP PROCEDURE {target}');
ELSE IF @existing_type IN ({functions})
    EXEC (N'DROP FUNCTION {target}');",
        procedures = catalog_type_list(PROCEDURE_TYPES),
        functions = catalog_type_list(FUNCTION_TYPES),
    )
}
