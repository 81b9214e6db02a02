// Copyright (c) The stackfix Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The state document describing a provisioned stack.
//!
//! A [`StackState`] is a minimal view of a provisioning tool's state: for every resource type and
//! name, the attributes needed to find that resource again, plus the stack's outputs. It's what
//! tests consume, what gets cached next to a module for other workers, and what replay mode loads
//! instead of provisioning.

use crate::{errors::StateError, identifier::ResourceName};
use atomicwrites::{AllowOverwrite, AtomicFile};
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize, de::Error as _};
use serde_json::{Map, Value, ser::PrettyFormatter};
use std::{
    collections::BTreeMap,
    fs,
    io::{self, Write},
    str::FromStr,
};

/// The file, inside a module directory, where a provisioned state is cached for reuse and replay.
pub const REPLAY_FILE_NAME: &str = "tf_resources.json";

/// The key that marks a document as a recorded state rather than raw provisioning output.
const RECORDED_KEY: &str = "pytest-terraform";

/// The recorded format version written by [`StackState::to_json`].
const RECORDED_VERSION: u32 = 1;

/// The attributes of a single resource.
pub type Attributes = Map<String, Value>;

/// Resources keyed by type, then by name.
pub type ResourceMap = BTreeMap<String, BTreeMap<String, Attributes>>;

/// Returns the replay cache path for a module directory.
pub fn replay_path(module_dir: &Utf8Path) -> Utf8PathBuf {
    module_dir.join(REPLAY_FILE_NAME)
}

/// The resources and outputs of a provisioned stack.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StackState {
    resources: ResourceMap,
    outputs: Map<String, Value>,
}

impl StackState {
    /// Creates a new state from its parts.
    pub fn new(resources: ResourceMap, outputs: Map<String, Value>) -> Self {
        Self { resources, outputs }
    }

    /// Loads a state document from a file.
    ///
    /// The file may hold any format accepted by [`FromStr`].
    pub fn from_path(path: &Utf8Path) -> Result<Self, StateError> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                return Err(StateError::NotFound {
                    path: path.to_owned(),
                });
            }
            Err(error) => {
                return Err(StateError::Read {
                    path: path.to_owned(),
                    error,
                });
            }
        };
        contents.parse()
    }

    /// Returns every resource, keyed by type and then name.
    pub fn resources(&self) -> &ResourceMap {
        &self.resources
    }

    /// Returns a mutable reference to the resources.
    pub fn resources_mut(&mut self) -> &mut ResourceMap {
        &mut self.resources
    }

    /// Returns the stack's outputs.
    pub fn outputs(&self) -> &Map<String, Value> {
        &self.outputs
    }

    /// Returns a mutable reference to the outputs.
    pub fn outputs_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.outputs
    }

    /// Looks up a value by key.
    ///
    /// * A key containing `.` is a path into the resources: `type.name.attribute`, descending
    ///   further into nested objects and arrays (by index) for each extra segment.
    /// * Any other key is a resource name, searched across every type. If the resource's only
    ///   attribute is `id`, the id is returned; otherwise all of its attributes are.
    ///
    /// Returns `Ok(None)` if nothing matches, and [`StateError::AmbiguousLookup`] if a bare name
    /// matches resources of more than one type.
    pub fn get(&self, key: &str) -> Result<Option<Value>, StateError> {
        if key.contains('.') {
            return Ok(self.query_path(key));
        }

        let mut matches = self
            .resources
            .iter()
            .filter_map(|(rtype, by_name)| by_name.get(key).map(|attrs| (rtype, attrs)));
        let Some((first_type, attrs)) = matches.next() else {
            return Ok(None);
        };
        let rest: Vec<_> = matches.collect();
        if !rest.is_empty() {
            let matches = std::iter::once(first_type)
                .chain(rest.iter().map(|(rtype, _)| *rtype))
                .map(|rtype| format!("{rtype}.{key}"))
                .collect();
            return Err(StateError::AmbiguousLookup {
                name: key.to_owned(),
                matches,
            });
        }

        if attrs.len() == 1
            && let Some(id) = attrs.get("id")
        {
            return Ok(Some(id.clone()));
        }
        Ok(Some(Value::Object(attrs.clone())))
    }

    fn query_path(&self, key: &str) -> Option<Value> {
        let mut segments = key.split('.');
        let by_name = self.resources.get(segments.next()?)?;
        let name = segments.next()?;
        let mut current = by_name.get(name).map(|attrs| Value::Object(attrs.clone()))?;
        for segment in segments {
            current = match current {
                Value::Object(mut map) => map.remove(segment)?,
                Value::Array(mut items) => {
                    let index: usize = segment.parse().ok()?;
                    if index >= items.len() {
                        return None;
                    }
                    items.swap_remove(index)
                }
                _ => return None,
            };
        }
        Some(current)
    }

    /// Renders this state in the recorded format, indented by four spaces.
    pub fn to_json(&self) -> Result<String, StateError> {
        let recorded = RecordedStateRef {
            version: RECORDED_VERSION,
            outputs: &self.outputs,
            resources: &self.resources,
        };

        let mut buf = Vec::new();
        let mut serializer =
            serde_json::Serializer::with_formatter(&mut buf, PrettyFormatter::with_indent(b"    "));
        recorded
            .serialize(&mut serializer)
            .map_err(StateError::Serialize)?;
        // serde_json only produces valid UTF-8.
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Saves this state in the recorded format, replacing `path` atomically.
    pub fn save(&self, path: &Utf8Path) -> Result<(), StateError> {
        let json = self.to_json()?;
        AtomicFile::new(path, AllowOverwrite)
            .write(|file| file.write_all(json.as_bytes()))
            .map_err(|error| StateError::Write {
                path: path.to_owned(),
                error: match error {
                    atomicwrites::Error::Internal(error) | atomicwrites::Error::User(error) => {
                        error
                    }
                },
            })
    }
}

impl FromStr for StackState {
    type Err = StateError;

    /// Parses a recorded state, a modern provisioning state, or a legacy module-based state.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value: Value = serde_json::from_str(s).map_err(StateError::Parse)?;
        if value.get(RECORDED_KEY).is_some() {
            let recorded: RecordedState =
                serde_json::from_value(value).map_err(StateError::Parse)?;
            return Ok(Self::new(recorded.resources, recorded.outputs));
        }

        let raw: RawState = serde_json::from_value(value).map_err(StateError::Parse)?;
        let mut resources = ResourceMap::new();

        for resource in raw.resources {
            let attributes = resource
                .instances
                .into_iter()
                .next()
                .map(|instance| instance.attributes)
                .unwrap_or_default();
            resources
                .entry(resource.resource_type)
                .or_default()
                .insert(resource.name, attributes);
        }

        for module in raw.modules {
            for (key, resource) in module.resources {
                if key.starts_with("data.") {
                    continue;
                }
                let (rtype, rname) = key.split_once('.').ok_or_else(|| {
                    StateError::Parse(serde_json::Error::custom(format!(
                        "legacy resource key `{key}` is not of the form `type.name`"
                    )))
                })?;

                let id = resource.primary.id;
                let mut attrs = Attributes::new();
                for (attr, value) in resource.primary.attributes {
                    if attr.contains("name") && value.as_str() != Some(id.as_str()) {
                        attrs.insert(attr, value);
                    }
                }
                attrs.insert("id".to_owned(), Value::String(id));

                resources
                    .entry(rtype.to_owned())
                    .or_default()
                    .insert(rname.to_owned(), attrs);
            }
        }

        Ok(Self::new(resources, raw.outputs))
    }
}

/// Adjusts a freshly provisioned state before it's cached and handed to tests.
pub trait StateHook {
    /// Modifies `state`, which was just produced for the resource `name`.
    fn modify_state(&self, name: &ResourceName, state: &mut StackState);
}

impl<F> StateHook for F
where
    F: Fn(&ResourceName, &mut StackState),
{
    fn modify_state(&self, name: &ResourceName, state: &mut StackState) {
        self(name, state)
    }
}

#[derive(Serialize)]
struct RecordedStateRef<'a> {
    #[serde(rename = "pytest-terraform")]
    version: u32,
    outputs: &'a Map<String, Value>,
    resources: &'a ResourceMap,
}

#[derive(Deserialize)]
struct RecordedState {
    #[serde(default)]
    outputs: Map<String, Value>,
    #[serde(default)]
    resources: ResourceMap,
}

#[derive(Deserialize)]
struct RawState {
    #[serde(default)]
    resources: Vec<RawResource>,
    #[serde(default)]
    outputs: Map<String, Value>,
    #[serde(default)]
    modules: Vec<RawModule>,
}

#[derive(Deserialize)]
struct RawResource {
    #[serde(rename = "type")]
    resource_type: String,
    name: String,
    #[serde(default)]
    instances: Vec<RawInstance>,
}

#[derive(Deserialize)]
struct RawInstance {
    #[serde(default)]
    attributes: Attributes,
}

#[derive(Deserialize)]
struct RawModule {
    #[serde(default)]
    resources: BTreeMap<String, RawLegacyResource>,
}

#[derive(Deserialize)]
struct RawLegacyResource {
    primary: RawPrimary,
}

#[derive(Deserialize)]
struct RawPrimary {
    id: String,
    #[serde(default)]
    attributes: BTreeMap<String, Value>,
}
