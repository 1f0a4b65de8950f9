//! Compact schema compiler
//!
//! Turns the compact, marker-annotated schema form of a
//! ResourceGraphDefinition into OpenAPI structural schemas suitable for
//! embedding into a CRD. Field specs look like:
//!
//! ```yaml
//! spec:
//!   name: string | required=true description="The name of the resource"
//!   replicas: integer | default=3 minimum=1 maximum=10
//!   tags: '[]string | maxItems=20'
//!   endpoints: map[string]string
//!   config: { region: string, tier: string }
//!   database: DatabaseConfig          # named custom type from `types:`
//! ```
//!
//! Custom types may reference other custom types; they are resolved in
//! dependency order and cycles are a hard error.

mod markers;
mod transform;
mod types;

pub use markers::{parse_markers, Marker, MarkerKind};
pub use transform::{apply_defaults, CompiledSchema, StatusProjection, Transformer};
pub use types::{parse_field, SimpleType};
