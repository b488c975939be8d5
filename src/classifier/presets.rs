//! Built-in rulesets. Profiles may override any of them by declaring a ruleset with the same name.

use crate::classifier::record::{Confidence, Decision};
use crate::classifier::ruleset::{CategoryRule, DecisionCut, PatternSpec, Proximity, Ruleset};

const NON_ANIMAL_CONTEXT: &str = "horse|equine|dog|animal|pet";

fn guarded(pattern: &str, not_followed_by: &[&str]) -> PatternSpec {
    PatternSpec::Guarded {
        pattern: pattern.to_string(),
        not_followed_by: not_followed_by.iter().map(|s| s.to_string()).collect(),
    }
}

fn words(patterns: &[&str]) -> Vec<String> {
    patterns.iter().map(|s| s.to_string()).collect()
}

/// Names of every built-in ruleset
pub fn names() -> Vec<&'static str> {
    vec![
        "church-ministry",
        "aba-therapy",
        "animal-assisted-therapy",
        "pet-therapy-lenient",
    ]
}

pub fn all() -> Vec<Ruleset> {
    vec![
        church_ministry(),
        aba_therapy(),
        animal_assisted_therapy(),
        pet_therapy_lenient(),
    ]
}

pub fn builtin(name: &str) -> Option<Ruleset> {
    all().into_iter().find(|r| r.name == name)
}

/// Churches with autism or special-needs ministries in Florida
pub fn church_ministry() -> Ruleset {
    Ruleset {
        name: "church-ministry".to_string(),
        description: "Faith communities with autism or special-needs programs".to_string(),
        categories: vec![
            CategoryRule::confirming(
                "special_needs_ministry",
                5,
                &[
                    r"special[- ]needs (ministry|sunday school|worship|class)",
                    r"(disability|inclusion|adaptive|access|abilities|buddy) ministr(y|ies)",
                    r"buddy (break|program|system)",
                    r"respite nights?",
                    r"night to shine",
                    r"champions club",
                    r"friendship (ministry|circle)",
                    r"ability tree",
                    r"special gathering",
                    r"wonderfully made",
                ],
            ),
            CategoryRule::confirming(
                "autism",
                3,
                &[
                    r"\bautism\b",
                    r"\bautistic\b",
                    r"asperger",
                    r"neurodiver(se|sity|gent)",
                    r"\basd\b",
                ],
            ),
            CategoryRule::confirming(
                "accommodations",
                2,
                &[
                    r"sensory[- ](friendly|room|sensitive)",
                    r"quiet (room|worship)",
                    r"calm (service|space)",
                    r"visual schedule",
                    r"social stor(y|ies)",
                    r"weighted blanket",
                    r"noise[- ]cancell?ing",
                    r"children with disabilities",
                    r"developmental (delay|disabilit)",
                    r"down syndrome",
                ],
            ),
            CategoryRule::confirming(
                "faith_community",
                2,
                &[
                    r"\bchurch\b",
                    r"\bministry\b",
                    r"\bworship\b",
                    r"\bcongregation\b",
                    r"\bparish\b",
                    r"\bsynagogue\b",
                    r"\bchapel\b",
                ],
            ),
            CategoryRule::confirming(
                "florida",
                1,
                &[r"\bflorida\b", r",\s*fl\b", r"\bfl\s+\d{5}\b"],
            ),
        ],
        cuts: vec![
            DecisionCut::new(8, Decision::Keep, Confidence::High),
            DecisionCut::new(5, Decision::Keep, Confidence::Medium),
            DecisionCut::new(3, Decision::Review, Confidence::Low),
        ],
        max_evidence: 3,
    }
}

/// Applied Behavior Analysis providers, told apart from general behavioral therapy
pub fn aba_therapy() -> Ruleset {
    let mut pediatric = CategoryRule::confirming("pediatric_therapy", 2, &[]);
    pediatric.proximity = Some(Proximity {
        anchors: words(&[
            r"\bpediatric\b",
            r"\bchildren\b",
            r"\bkids\b",
            r"\bchild\b",
            r"\byouth\b",
            r"\badolescents?\b",
            r"\binfants?\b",
            r"\btoddlers?\b",
        ]),
        near: words(&[
            r"speech therapy",
            r"speech[- ]language",
            r"speech patholog",
            r"occupational therap",
            r"physical therap",
        ]),
        window: 40,
    });

    Ruleset {
        name: "aba-therapy".to_string(),
        description: "Applied Behavior Analysis providers".to_string(),
        categories: vec![
            CategoryRule::confirming(
                "aba",
                10,
                &[
                    r"\baba\b",
                    r"applied behaviou?r analysis",
                    r"\bbcba\b",
                    r"\brbt\b",
                    r"board certified behavior analyst",
                ],
            ),
            CategoryRule::confirming(
                "behavior_analysis",
                4,
                &[
                    r"behavior analysis",
                    r"behavioral therapy",
                    r"behavior modification",
                    r"behavior specialist",
                ],
            ),
            CategoryRule::confirming(
                "autism",
                3,
                &[r"\bautism\b", r"\basd\b", r"autism spectrum", r"\bautistic\b", r"asperger"],
            ),
            pediatric,
        ],
        cuts: vec![
            DecisionCut::new(10, Decision::Keep, Confidence::High),
            DecisionCut::new(4, Decision::Keep, Confidence::Medium),
            DecisionCut::new(2, Decision::Review, Confidence::Low),
        ],
        max_evidence: 3,
    }
}

/// Therapy for humans delivered with animals. Therapy *for* animals is a hard exclusion.
pub fn animal_assisted_therapy() -> Ruleset {
    let mut near_therapy = CategoryRule::confirming("animal_near_therapy", 1, &[]);
    near_therapy.proximity = Some(Proximity {
        anchors: words(&[
            r"\bhorses?\b",
            r"\bequine\b",
            r"\bequestrian\b",
            r"\bdogs?\b",
            r"\bcanine\b",
            r"\bpets?\b",
            r"\banimals?\b",
            r"\bpony\b",
            r"\bponies\b",
        ]),
        near: words(&[
            r"\btherapy\b",
            r"\btherapeutic\b",
            r"\btreatment\b",
            r"\brehabilitation\b",
            r"\bintervention\b",
        ]),
        window: 25,
    });

    let non_animal = CategoryRule {
        patterns: vec![
            guarded("physical therapy", &[NON_ANIMAL_CONTEXT]),
            guarded("occupational therapy", &[NON_ANIMAL_CONTEXT]),
            guarded("speech therapy", &[NON_ANIMAL_CONTEXT]),
            guarded("massage therapy", &[NON_ANIMAL_CONTEXT]),
            guarded("psychotherapy", &["horse|equine|dog|animal|pet|assisted"]),
            guarded("counseling", &["horse|equine|dog|animal|pet|assisted"]),
            guarded(r"\baba therapy", &[NON_ANIMAL_CONTEXT]),
        ],
        ..CategoryRule::disqualifying("non_animal_therapy", 3, &[])
    };

    Ruleset {
        name: "animal-assisted-therapy".to_string(),
        description: "Animal-assisted therapy for people, excluding veterinary rehabilitation"
            .to_string(),
        categories: vec![
            CategoryRule::hard_exclusion(
                "animal_rehabilitation",
                10,
                vec![
                    guarded("animal rehabilitation", &["for (people|children|humans)"]),
                    "pet rehabilitation".into(),
                    guarded("canine rehabilitation", &["service"]),
                    guarded("dog rehabilitation", &["service"]),
                    guarded("equine rehabilitation", &["therap"]),
                    "veterinary rehabilitation".into(),
                    "vet rehab".into(),
                    guarded("animal physical therapy", &["for people"]),
                    "pet physical therapy".into(),
                    guarded("canine physical therapy", &["service"]),
                    guarded("dog physical therapy", &["service"]),
                    "animal chiropractic".into(),
                    "pet chiropractic".into(),
                    "veterinary physical therapy".into(),
                    guarded("animal hydrotherapy", &["assisted"]),
                    guarded("canine hydrotherapy", &["service"]),
                ],
            ),
            CategoryRule::confirming(
                "animal_assisted",
                10,
                &[
                    r"animal[- ]assisted (psycho)?therapy",
                    r"pet[- ]assisted therapy",
                    r"equine[- ]assisted (psycho)?therapy",
                    r"hippotherapy",
                    r"therapeutic riding",
                    r"therapeutic horsemanship",
                    r"therapy dogs?",
                    r"therapy animals?",
                    r"(service|assistance) dog training",
                ],
            ),
            CategoryRule::confirming(
                "human_benefit",
                3,
                &[
                    r"children with autism",
                    r"autism spectrum",
                    r"special needs",
                    r"disabilities",
                    r"developmental",
                    r"\bveterans\b",
                    r"\bptsd\b",
                    r"mental health.*(horse|animal|dog)",
                ],
            ),
            near_therapy,
            non_animal,
            CategoryRule::confirming(
                "autism_context",
                0,
                &[
                    r"\bautism\b",
                    r"\bautistic\b",
                    r"\basd\b",
                    r"asperger",
                    r"neurodivergent",
                ],
            ),
        ],
        cuts: vec![
            DecisionCut::new(10, Decision::Keep, Confidence::High),
            DecisionCut::new(5, Decision::Keep, Confidence::Medium),
            DecisionCut::new(2, Decision::Review, Confidence::Low),
        ],
        max_evidence: 3,
    }
}

/// Looser website check for pet-therapy listings: no hard exclusion, penalties for pet businesses
pub fn pet_therapy_lenient() -> Ruleset {
    Ruleset {
        name: "pet-therapy-lenient".to_string(),
        description: "Loose pet-therapy website check used for bulk review queues".to_string(),
        categories: vec![
            CategoryRule::confirming(
                "animal_therapy",
                3,
                &[
                    r"animal[- ]assisted (psycho)?therapy",
                    r"pet therapy",
                    r"therapy (animal|dog program)",
                    r"canine[- ]assisted therapy",
                    r"facility dog",
                    r"emotional support animal",
                    r"service animal training",
                ],
            ),
            CategoryRule::confirming(
                "equine_programs",
                3,
                &[
                    r"hippotherapy",
                    r"equine[- ]assisted",
                    r"equine therapy",
                    r"therapeutic (riding|horseback)",
                    r"adaptive riding",
                ],
            ),
            CategoryRule::confirming(
                "population",
                2,
                &[r"\bautism\b", r"special needs", r"disabilit(y|ies)"],
            ),
            CategoryRule::disqualifying(
                "pet_business",
                3,
                &[
                    r"veterinary services",
                    r"vet clinic",
                    r"animal hospital",
                    r"(pet|dog)? ?grooming",
                    r"(pet )?boarding",
                    r"\bdaycare\b",
                ],
            ),
            CategoryRule::disqualifying(
                "lessons",
                2,
                &[
                    r"obedience training",
                    r"dog training classes",
                    r"(horseback |equestrian )?riding lessons",
                ],
            ),
        ],
        cuts: vec![
            DecisionCut::new(6, Decision::Keep, Confidence::High),
            DecisionCut::new(3, Decision::Keep, Confidence::Medium),
            DecisionCut::new(1, Decision::Review, Confidence::Low),
        ],
        max_evidence: 5,
    }
}
