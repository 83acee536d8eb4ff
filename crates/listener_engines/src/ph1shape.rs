#![forbid(unsafe_code)]

use listener_kernel_contracts::ph1harm::{SafetyAssessment, SafetyLevel};
use listener_kernel_contracts::ph1mode::{IntentCue, Mode, ModeRequest, TurnIntent};
use listener_kernel_contracts::ph1shape::{
    ResponseDirective, TemplateConstraints, PH1SHAPE_CONTRACT_VERSION,
};

use crate::ph1harm::{contains_phrase, normalize_tokens};

pub const COOLDOWN_SCRIPT: &str =
    "We're taking a short pause to keep things safe. Let's breathe together, then you can try again.";
pub const SAFETY_SCRIPT: &str = "I hear you're struggling. For safety, let's pause and reach out to someone you trust or a local helpline.";
/// Reply used when no generation collaborator is configured.
pub const PLACEHOLDER_REPLY: &str = "I hear you. I'm here with you.";

pub const INTAKE_QUESTION: &str = "Do you want me to just listen, or help calming down?";

const BASE: TemplateConstraints = TemplateConstraints {
    max_sentences: None,
    unsolicited_advice: false,
    paraphrase: false,
    label_emotion: false,
    validate_feeling: false,
    grounding_exercises: 0,
    wait_for_user: false,
    concrete_steps: 0,
    draft_message_optional: false,
    emergency_contact_framing: false,
    forbid_debate_or_shaming: false,
    opening_question: None,
    generation_permitted: true,
};

/// Template constraints per mode. Total over `Mode`.
pub const fn constraints_for(mode: Mode) -> TemplateConstraints {
    match mode {
        Mode::Intake => TemplateConstraints {
            max_sentences: Some(2),
            opening_question: Some(INTAKE_QUESTION),
            ..BASE
        },
        Mode::Vent => TemplateConstraints {
            max_sentences: Some(2),
            ..BASE
        },
        Mode::Reflect => TemplateConstraints {
            paraphrase: true,
            label_emotion: true,
            validate_feeling: true,
            ..BASE
        },
        Mode::Regulate => TemplateConstraints {
            grounding_exercises: 1,
            wait_for_user: true,
            ..BASE
        },
        Mode::Plan => TemplateConstraints {
            concrete_steps: 1,
            draft_message_optional: true,
            ..BASE
        },
        Mode::Safety => TemplateConstraints {
            grounding_exercises: 1,
            emergency_contact_framing: true,
            forbid_debate_or_shaming: true,
            ..BASE
        },
        Mode::Cooldown => TemplateConstraints {
            generation_permitted: false,
            ..BASE
        },
    }
}

pub fn fixed_reply_for(mode: Mode) -> Option<&'static str> {
    match mode {
        Mode::Safety => Some(SAFETY_SCRIPT),
        Mode::Cooldown => Some(COOLDOWN_SCRIPT),
        Mode::Intake | Mode::Vent | Mode::Reflect | Mode::Regulate | Mode::Plan => None,
    }
}

/// Builds the directive for a resolved mode. Pure; equal inputs give equal directives.
pub fn shape(mode: Mode, assessment: &SafetyAssessment) -> ResponseDirective {
    let constraints = constraints_for(mode);
    let surfaced_reasons = if assessment.level == SafetyLevel::Safe {
        Vec::new()
    } else {
        assessment.reason_list()
    };
    let guidance = render_guidance(mode, &constraints, assessment.level, &surfaced_reasons);
    ResponseDirective {
        schema_version: PH1SHAPE_CONTRACT_VERSION,
        mode,
        constraints,
        safety_level: assessment.level,
        surfaced_reasons,
        guidance,
        fixed_reply: fixed_reply_for(mode).map(str::to_string),
    }
}

fn render_guidance(
    mode: Mode,
    c: &TemplateConstraints,
    level: SafetyLevel,
    reasons: &[listener_kernel_contracts::ph1harm::HarmReason],
) -> String {
    let mut lines = vec![format!(
        "You are a calm, supportive listening companion. Current mode: {}.",
        mode.as_str()
    )];
    if !c.generation_permitted {
        lines.push("Do not generate a reply; the fixed pause script is used.".to_string());
        return lines.join("\n");
    }
    if let Some(q) = c.opening_question {
        lines.push(format!("Ask exactly this question: \"{q}\""));
    }
    if let Some(n) = c.max_sentences {
        lines.push(format!("Reply in at most {n} sentences."));
    }
    if !c.unsolicited_advice {
        lines.push("Do not give advice the user did not ask for.".to_string());
    }
    if c.paraphrase {
        lines.push("Paraphrase what the user said.".to_string());
    }
    if c.label_emotion {
        lines.push("Name the emotion you hear.".to_string());
    }
    if c.validate_feeling {
        lines.push("Validate that the feeling makes sense.".to_string());
    }
    if c.grounding_exercises > 0 {
        lines.push(format!(
            "Offer exactly {} short grounding exercise.",
            c.grounding_exercises
        ));
    }
    if c.wait_for_user {
        lines.push("Then stop and wait for the user to respond.".to_string());
    }
    if c.concrete_steps > 0 {
        lines.push(format!("Suggest exactly {} concrete next step.", c.concrete_steps));
    }
    if c.draft_message_optional {
        lines.push("You may offer a short draft message the user could send.".to_string());
    }
    if c.emergency_contact_framing {
        lines.push(
            "Encourage reaching out to someone they trust or a local emergency or crisis line."
                .to_string(),
        );
    }
    if c.forbid_debate_or_shaming {
        lines.push("Never argue, debate, judge or shame.".to_string());
    }
    if level != SafetyLevel::Safe {
        let tags: Vec<&str> = reasons.iter().map(|r| r.as_str()).collect();
        if tags.is_empty() {
            lines.push(format!("Safety level: {}.", level.as_str()));
        } else {
            lines.push(format!(
                "Safety level: {} ({}).",
                level.as_str(),
                tags.join(", ")
            ));
        }
    }
    lines.join("\n")
}

// Checked in order; the first matching request wins.
const EXPLICIT_PHRASES: &[(ModeRequest, &str)] = &[
    (ModeRequest::Regulate, "calm down"),
    (ModeRequest::Regulate, "calming down"),
    (ModeRequest::Regulate, "help me breathe"),
    (ModeRequest::Regulate, "breathing exercise"),
    (ModeRequest::Plan, "make a plan"),
    (ModeRequest::Plan, "help me plan"),
    (ModeRequest::Reflect, "help me think"),
    (ModeRequest::Reflect, "think this through"),
    (ModeRequest::Reflect, "make sense of"),
    (ModeRequest::Vent, "just listen"),
    (ModeRequest::Vent, "let me vent"),
    (ModeRequest::Vent, "need to vent"),
];

const NEXT_STEP_PHRASES: &[&str] = &[
    "what should i do",
    "what do i do",
    "what can i do",
    "next step",
    "next steps",
    "how do i",
];

const STUCK_PHRASES: &[&str] = &[
    "stuck",
    "can't stop thinking",
    "going in circles",
    "keep thinking",
    "over and over",
];

const QUESTION_OPENERS: &[&str] = &[
    "what", "why", "how", "when", "where", "who", "should", "could", "would", "is", "are", "do",
    "does", "can",
];

/// Deterministic intent inference from the utterance text.
pub fn infer_intent(text: &str) -> TurnIntent {
    let tokens = normalize_tokens(text);
    let explicit = EXPLICIT_PHRASES
        .iter()
        .find(|(_, phrase)| contains_phrase(&tokens, phrase))
        .map(|(request, _)| *request);

    let cue = if NEXT_STEP_PHRASES.iter().any(|p| contains_phrase(&tokens, p)) {
        IntentCue::NextSteps
    } else if STUCK_PHRASES.iter().any(|p| contains_phrase(&tokens, p)) {
        IntentCue::StuckFeeling
    } else if text.trim_end().ends_with('?')
        || tokens
            .first()
            .is_some_and(|t| QUESTION_OPENERS.contains(&t.as_str()))
    {
        IntentCue::Question
    } else {
        IntentCue::None
    };

    TurnIntent { explicit, cue }
}
