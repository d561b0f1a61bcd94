//! Loading of the XML type model describing the target library.
//!
//! The model is produced by an external header parser and consumed here.
//! Its shape is a single root element holding `<function name="...">` and
//! `<usertype id="N" type="struct|union">` children, each of which lists
//! its member types as `<param type="CODE"/>` children in positional order.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use xml::reader::{EventReader, XmlEvent};

use crate::trace::types::TypeCode;
use crate::Error;

/// Whether a user-defined type overlays its fields or lays them out.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Composite {
    /// Fields at increasing aligned offsets.
    Struct,
    /// Fields overlaid at offset zero.
    Union,
}

/// A user-defined aggregate type from the model.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserType {
    /// Struct or union.
    pub kind: Composite,
    /// Member type codes in declaration order.
    pub fields: Vec<TypeCode>,
}

/// One exported function of the target library.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FunctionModel {
    /// Exported symbol name.
    pub name: String,
    /// Parameter type codes in positional order.
    pub params: Vec<TypeCode>,
}

/// The parsed type model: exported functions plus user type definitions.
#[derive(Clone, Debug, Default)]
pub struct Model {
    functions: Vec<FunctionModel>,
    usertypes: HashMap<String, UserType>,
}

impl Model {
    /// Reads and parses a model file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|e| Error::file(e, format!("could not open model file {}", path.display())))?;
        Self::from_reader(BufReader::new(file))
    }

    /// Parses a model from any reader.
    pub fn from_reader<R: Read>(reader: R) -> Result<Self, Error> {
        let mut functions = Vec::new();
        let mut usertypes = HashMap::new();
        // The element currently collecting <param> children, if any.
        let mut current_func: Option<FunctionModel> = None;
        let mut current_user: Option<(String, UserType)> = None;

        for event in EventReader::new(reader) {
            let event =
                event.map_err(|e| Error::illegal_argument(format!("malformed model xml: {e}")))?;
            match event {
                XmlEvent::StartElement {
                    name, attributes, ..
                } => match name.local_name.as_str() {
                    "function" => {
                        let name = attr(&attributes, "name").ok_or_else(|| {
                            Error::illegal_argument("function element without name attribute")
                        })?;
                        current_func = Some(FunctionModel {
                            name,
                            params: Vec::new(),
                        });
                    }
                    "usertype" => {
                        let id = attr(&attributes, "id").ok_or_else(|| {
                            Error::illegal_argument("usertype element without id attribute")
                        })?;
                        if !id.bytes().all(|b| b.is_ascii_digit()) {
                            return Err(Error::illegal_argument(format!(
                                "usertype id is not decimal: {id}"
                            )));
                        }
                        let kind = match attr(&attributes, "type").as_deref() {
                            Some("struct") => Composite::Struct,
                            Some("union") => Composite::Union,
                            other => {
                                return Err(Error::illegal_argument(format!(
                                    "usertype {id} has unknown kind {other:?}"
                                )))
                            }
                        };
                        current_user = Some((
                            id,
                            UserType {
                                kind,
                                fields: Vec::new(),
                            },
                        ));
                    }
                    "param" => {
                        let code = attr(&attributes, "type").ok_or_else(|| {
                            Error::illegal_argument("param element without type attribute")
                        })?;
                        let code = TypeCode::new(&code)?;
                        if let Some(func) = current_func.as_mut() {
                            func.params.push(code);
                        } else if let Some((_, user)) = current_user.as_mut() {
                            user.fields.push(code);
                        } else {
                            return Err(Error::illegal_argument(
                                "param element outside function or usertype",
                            ));
                        }
                    }
                    _ => {}
                },
                XmlEvent::EndElement { name } => match name.local_name.as_str() {
                    "function" => {
                        if let Some(func) = current_func.take() {
                            functions.push(func);
                        }
                    }
                    "usertype" => {
                        if let Some((id, user)) = current_user.take() {
                            usertypes.insert(id, user);
                        }
                    }
                    _ => {}
                },
                _ => {}
            }
        }

        Ok(Model {
            functions,
            usertypes,
        })
    }

    /// The exported functions in model order.
    #[must_use]
    pub fn functions(&self) -> &[FunctionModel] {
        &self.functions
    }

    /// Looks up a function by its exported name.
    #[must_use]
    pub fn function(&self, name: &str) -> Option<&FunctionModel> {
        self.functions.iter().find(|f| f.name == name)
    }

    /// The user type table keyed by decimal id.
    #[must_use]
    pub fn usertypes(&self) -> &HashMap<String, UserType> {
        &self.usertypes
    }
}

fn attr(attributes: &[xml::attribute::OwnedAttribute], name: &str) -> Option<String> {
    attributes
        .iter()
        .find(|a| a.name.local_name == name)
        .map(|a| a.value.clone())
}
