//! Builtin entity types: metadata trees, files and datasets, and the
//! electrophysiology containers.

use crate::fields::{FieldDescriptor as F, PlainType, FLOAT_ARRAY, TAGS};
use crate::registry::{ChildSet, EntityType};

pub static ALL: &[&EntityType] = &[
    &SECTION,
    &PROPERTY,
    &VALUE,
    &DATAFILE,
    &DATASET,
    &EXPERIMENT,
    &BLOCK,
    &SEGMENT,
    &EVENT,
    &ANALOGSIGNAL,
];

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

pub static SECTION: EntityType = EntityType {
    name: "section",
    fields: &[
        F::text("name").required(),
        F::text("odml_type"),
        F::text("description"),
        F::plain("position", PlainType::Integer),
        F::plain("is_template", PlainType::Bool),
        F::special("tags", &TAGS),
        F::reference("parent_section", "section"),
    ],
    children: &[
        ChildSet {
            entity_type: "section",
            field: "parent_section",
        },
        ChildSet {
            entity_type: "property",
            field: "section",
        },
        ChildSet {
            entity_type: "datafile",
            field: "section",
        },
        ChildSet {
            entity_type: "dataset",
            field: "section",
        },
        ChildSet {
            entity_type: "experiment",
            field: "section",
        },
        ChildSet {
            entity_type: "block",
            field: "section",
        },
    ],
    cascade_exclude: &["parent_section"],
};

pub static PROPERTY: EntityType = EntityType {
    name: "property",
    fields: &[
        F::text("name").required(),
        F::text("definition"),
        F::text("dependency"),
        F::text("dependency_value"),
        F::reference("section", "section").required(),
    ],
    children: &[ChildSet {
        entity_type: "value",
        field: "parent_property",
    }],
    cascade_exclude: &["section"],
};

pub static VALUE: EntityType = EntityType {
    name: "value",
    fields: &[
        F::text("data").required(),
        F::text("uncertainty"),
        F::text("unit"),
        F::text("definition"),
        F::reference("parent_property", "property").required(),
    ],
    children: &[],
    cascade_exclude: &["parent_property"],
};

// ---------------------------------------------------------------------------
// Files and datasets
// ---------------------------------------------------------------------------

pub static DATAFILE: EntityType = EntityType {
    name: "datafile",
    fields: &[
        F::text("title").required(),
        F::text("caption"),
        F::text("file_type"),
        F::plain("file_size", PlainType::Integer),
        F::special("tags", &TAGS),
        F::reference("section", "section"),
    ],
    children: &[],
    cascade_exclude: &["section"],
};

pub static DATASET: EntityType = EntityType {
    name: "dataset",
    fields: &[
        F::text("title").required(),
        F::text("caption"),
        F::special("tags", &TAGS),
        F::reference("section", "section"),
        F::many("datafiles", "datafile", true),
    ],
    children: &[],
    cascade_exclude: &["section"],
};

pub static EXPERIMENT: EntityType = EntityType {
    name: "experiment",
    fields: &[
        F::text("title").required(),
        F::text("caption"),
        F::plain("start_time", PlainType::Datetime),
        F::plain("end_time", PlainType::Datetime),
        F::special("tags", &TAGS),
        F::reference("section", "section"),
        F::many("datasets", "dataset", false),
    ],
    children: &[],
    cascade_exclude: &["section"],
};

// ---------------------------------------------------------------------------
// Electrophysiology
// ---------------------------------------------------------------------------

pub static BLOCK: EntityType = EntityType {
    name: "block",
    fields: &[
        F::text("name").required(),
        F::text("description"),
        F::plain("filedatetime", PlainType::Datetime),
        F::plain("index", PlainType::Integer),
        F::reference("section", "section"),
    ],
    children: &[ChildSet {
        entity_type: "segment",
        field: "block",
    }],
    cascade_exclude: &["section"],
};

pub static SEGMENT: EntityType = EntityType {
    name: "segment",
    fields: &[
        F::text("name").required(),
        F::text("description"),
        F::plain("filedatetime", PlainType::Datetime),
        F::plain("index", PlainType::Integer),
        F::reference("block", "block"),
    ],
    children: &[
        ChildSet {
            entity_type: "event",
            field: "segment",
        },
        ChildSet {
            entity_type: "analogsignal",
            field: "segment",
        },
    ],
    cascade_exclude: &["block"],
};

pub static EVENT: EntityType = EntityType {
    name: "event",
    fields: &[
        F::text("label").required(),
        F::data("time"),
        F::reference("segment", "segment"),
    ],
    children: &[],
    cascade_exclude: &["segment"],
};

pub static ANALOGSIGNAL: EntityType = EntityType {
    name: "analogsignal",
    fields: &[
        F::text("name").required(),
        F::data("sampling_rate"),
        F::data("t_start"),
        F::special("signal", &FLOAT_ARRAY),
        F::reference("segment", "segment"),
    ],
    children: &[],
    cascade_exclude: &["segment"],
};
