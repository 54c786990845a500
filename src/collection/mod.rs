// Collection layer.
//
// A collection pairs a storage adapter with one index manager per
// defined index and routes every operation through a transaction
// context.
//
// | Module | Responsibility |
// |--------|----------------|
// | [`definition`] | Index definitions, validators, collection config |
// | [`collection`] | `TransactionalCollection` + registry |

pub mod collection;
pub mod definition;

pub use collection::{CollectionRegistry, TransactionalCollection};
pub use definition::{
    AcceptAllValidator, CollectionConfig, DocumentValidator, IndexDefinition, KeyExtractor,
    PropertyType, SchemaValidator, ValidationOutcome,
};
