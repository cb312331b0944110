//! Entity data model: nouns, verbs, and their closed type enums.
//!
//! A **noun** is a typed entity carrying an embedding vector and structured
//! metadata. A **verb** is a typed, directed relationship between two nouns
//! with its own vector and metadata. Type names are closed enums on the
//! wire; unknown strings map to the generic catch-all (`Thing` for nouns,
//! `RelatedTo` for verbs) so old databases keep loading after the enum
//! grows.
//!
//! Metadata is a JSON object (`serde_json::Map`). Values the index layer
//! accepts are null, bool, i64, f64, string, and homogeneous arrays of at
//! most ten primitive elements; anything else is stored but not indexed.
//! Graph placement (level + per-level neighbor sets) is persisted in its
//! own record, see [`crate::graph`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Metadata object attached to an entity.
pub type Metadata = Map<String, Value>;

macro_rules! entity_type_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $fallback:ident, [ $($variant:ident => $label:literal),+ $(,)? ]
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $($variant,)+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant,)+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $label,)+
                }
            }

            /// Parse a type name; unknown strings fall back to the
            /// catch-all variant instead of failing.
            pub fn from_name(name: &str) -> Self {
                match name {
                    $($label => $name::$variant,)+
                    _ => $name::$fallback,
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                $name::$fallback
            }
        }
    };
}

entity_type_enum!(
    /// Closed set of noun kinds. `Thing` is the generic fallback.
    NounType, Thing, [
        Person => "Person",
        Organization => "Organization",
        Location => "Location",
        Event => "Event",
        Concept => "Concept",
        Thing => "Thing",
        Document => "Document",
        Topic => "Topic",
        Project => "Project",
        Task => "Task",
        Product => "Product",
        Service => "Service",
        Tool => "Tool",
        Technology => "Technology",
        Skill => "Skill",
        Language => "Language",
        Currency => "Currency",
        Animal => "Animal",
        Plant => "Plant",
        Food => "Food",
        Material => "Material",
        Vehicle => "Vehicle",
        Building => "Building",
        Device => "Device",
        Media => "Media",
        Book => "Book",
        Article => "Article",
        Website => "Website",
        Application => "Application",
        Dataset => "Dataset",
        Model => "Model",
        Process => "Process",
        Method => "Method",
        Theory => "Theory",
        Hypothesis => "Hypothesis",
        Question => "Question",
        Answer => "Answer",
        Goal => "Goal",
        Metric => "Metric",
        Resource => "Resource",
        Role => "Role",
        Team => "Team",
    ]
);

entity_type_enum!(
    /// Closed set of verb (relationship) kinds. `RelatedTo` is the generic
    /// fallback. Most verbs come in forward/inverse pairs.
    VerbType, RelatedTo, [
        RelatedTo => "relatedTo",
        Contains => "contains",
        PartOf => "partOf",
        LocatedIn => "locatedIn",
        Owns => "owns",
        OwnedBy => "ownedBy",
        Creates => "creates",
        CreatedBy => "createdBy",
        Uses => "uses",
        UsedBy => "usedBy",
        Produces => "produces",
        ProducedBy => "producedBy",
        Consumes => "consumes",
        ConsumedBy => "consumedBy",
        Requires => "requires",
        RequiredBy => "requiredBy",
        DependsOn => "dependsOn",
        DependencyOf => "dependencyOf",
        Supports => "supports",
        SupportedBy => "supportedBy",
        Implements => "implements",
        ImplementedBy => "implementedBy",
        Extends => "extends",
        ExtendedBy => "extendedBy",
        References => "references",
        ReferencedBy => "referencedBy",
        Describes => "describes",
        DescribedBy => "describedBy",
        Defines => "defines",
        DefinedBy => "definedBy",
        Causes => "causes",
        CausedBy => "causedBy",
        Precedes => "precedes",
        Follows => "follows",
        Enables => "enables",
        EnabledBy => "enabledBy",
        Prevents => "prevents",
        PreventedBy => "preventedBy",
        Improves => "improves",
        ImprovedBy => "improvedBy",
        Influences => "influences",
        InfluencedBy => "influencedBy",
        Measures => "measures",
        MeasuredBy => "measuredBy",
        Manages => "manages",
        ManagedBy => "managedBy",
        Employs => "employs",
        EmployedBy => "employedBy",
        MemberOf => "memberOf",
        HasMember => "hasMember",
        LeaderOf => "leaderOf",
        LedBy => "ledBy",
        Teaches => "teaches",
        TaughtBy => "taughtBy",
        Learns => "learns",
        LearnsFrom => "learnsFrom",
        Mentors => "mentors",
        MentoredBy => "mentoredBy",
        Knows => "knows",
        Likes => "likes",
        LikedBy => "likedBy",
        Trusts => "trusts",
        TrustedBy => "trustedBy",
        Helps => "helps",
        WorksWith => "worksWith",
        WorksFor => "worksFor",
        WorksOn => "worksOn",
        CollaboratesWith => "collaboratesWith",
        Attends => "attends",
        AttendedBy => "attendedBy",
        Hosts => "hosts",
        HostedBy => "hostedBy",
        Organizes => "organizes",
        OrganizedBy => "organizedBy",
        ParticipatesIn => "participatesIn",
        Sponsors => "sponsors",
        SponsoredBy => "sponsoredBy",
        Funds => "funds",
        FundedBy => "fundedBy",
        Buys => "buys",
        BoughtBy => "boughtBy",
        Sells => "sells",
        SoldBy => "soldBy",
        Supplies => "supplies",
        SuppliedBy => "suppliedBy",
        CompetesWith => "competesWith",
        PartnersWith => "partnersWith",
        Acquires => "acquires",
        AcquiredBy => "acquiredBy",
        MergesWith => "mergesWith",
        InvestsIn => "investsIn",
        Licenses => "licenses",
        LicensedBy => "licensedBy",
        Publishes => "publishes",
        PublishedBy => "publishedBy",
        Authors => "authors",
        AuthoredBy => "authoredBy",
        Edits => "edits",
        EditedBy => "editedBy",
        Reviews => "reviews",
        ReviewedBy => "reviewedBy",
        Cites => "cites",
        CitedBy => "citedBy",
        Translates => "translates",
        TranslatedBy => "translatedBy",
        Summarizes => "summarizes",
        SummarizedBy => "summarizedBy",
        Categorizes => "categorizes",
        CategorizedBy => "categorizedBy",
        Tags => "tags",
        TaggedBy => "taggedBy",
        LinksTo => "linksTo",
        Mentions => "mentions",
        MentionedBy => "mentionedBy",
        Represents => "represents",
        RepresentedBy => "representedBy",
        SimilarTo => "similarTo",
        OppositeOf => "oppositeOf",
        InstanceOf => "instanceOf",
        TypeOf => "typeOf",
        SubclassOf => "subclassOf",
        SuperclassOf => "superclassOf",
        TransformsInto => "transformsInto",
        Replaces => "replaces",
        ReplacedBy => "replacedBy",
        Succeeds => "succeeds",
        SucceededBy => "succeededBy",
    ]
);

/// A typed entity with an embedding vector and structured metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Noun {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub noun_type: NounType,
    pub vector: Vec<f32>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Noun {
    pub fn new(noun_type: NounType, vector: Vec<f32>) -> Self {
        Self {
            id: Uuid::new_v4(),
            noun_type,
            vector,
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A typed, directed relationship between two nouns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verb {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub verb_type: VerbType,
    pub source: Uuid,
    pub target: Uuid,
    pub vector: Vec<f32>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Verb {
    pub fn new(verb_type: VerbType, source: Uuid, target: Uuid, vector: Vec<f32>) -> Self {
        Self {
            id: Uuid::new_v4(),
            verb_type,
            source,
            target,
            vector,
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noun_type_round_trips_by_name() {
        for t in NounType::ALL {
            assert_eq!(NounType::from_name(t.as_str()), *t);
        }
    }

    #[test]
    fn test_unknown_noun_type_falls_back_to_thing() {
        assert_eq!(NounType::from_name("Widget"), NounType::Thing);
        assert_eq!(NounType::from_name(""), NounType::Thing);
    }

    #[test]
    fn test_unknown_verb_type_falls_back_to_related_to() {
        assert_eq!(VerbType::from_name("zapsWith"), VerbType::RelatedTo);
    }

    #[test]
    fn test_enum_sizes_match_design() {
        assert_eq!(NounType::ALL.len(), 42);
        assert_eq!(VerbType::ALL.len(), 127);
    }

    #[test]
    fn test_verb_serde_round_trip() {
        let verb = Verb::new(
            VerbType::Knows,
            Uuid::new_v4(),
            Uuid::new_v4(),
            vec![0.1, 0.2],
        );
        let json = serde_json::to_string(&verb).unwrap();
        let back: Verb = serde_json::from_str(&json).unwrap();
        assert_eq!(back.verb_type, VerbType::Knows);
        assert_eq!(back.source, verb.source);
    }
}
