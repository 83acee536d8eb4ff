#![forbid(unsafe_code)]

use listener_kernel_contracts::ph1harm::SafetyLevel;
use listener_kernel_contracts::ph1loop::DetectorSignal;
use listener_kernel_contracts::ph1mode::{
    IntentCue, Mode, ModeTransition, TurnIntent, PH1MODE_CONTRACT_VERSION,
};
use listener_kernel_contracts::ReasonCodeId;

pub mod reason_codes {
    use listener_kernel_contracts::ReasonCodeId;

    // PH1.MODE reason-code namespace.
    pub const MODE_COOLDOWN_GATE: ReasonCodeId = ReasonCodeId(0x4D4F_0001);
    pub const MODE_SAFETY_HIGH_RISK: ReasonCodeId = ReasonCodeId(0x4D4F_0002);
    pub const MODE_REGULATE_LOOPING: ReasonCodeId = ReasonCodeId(0x4D4F_0003);
    pub const MODE_REGULATE_ESCALATING: ReasonCodeId = ReasonCodeId(0x4D4F_0004);
    pub const MODE_RESOLVED_TO_INTAKE: ReasonCodeId = ReasonCodeId(0x4D4F_0005);
    pub const MODE_EXPLICIT_REQUEST: ReasonCodeId = ReasonCodeId(0x4D4F_0006);
    pub const MODE_INTAKE_PROGRESSION: ReasonCodeId = ReasonCodeId(0x4D4F_0007);
    pub const MODE_INFERRED_PLAN: ReasonCodeId = ReasonCodeId(0x4D4F_0008);
    pub const MODE_INFERRED_REFLECT: ReasonCodeId = ReasonCodeId(0x4D4F_0009);
    pub const MODE_STAY: ReasonCodeId = ReasonCodeId(0x4D4F_000A);
    pub const MODE_REGULATE_SETTLED: ReasonCodeId = ReasonCodeId(0x4D4F_000B);
}

pub const INITIAL_MODE: Mode = Mode::Intake;

/// Decides the session's next mode. Total over every input tuple and free of side effects.
pub fn next(
    current: Mode,
    safety_level: SafetyLevel,
    signal: DetectorSignal,
    cooldown_active: bool,
    intent: TurnIntent,
) -> ModeTransition {
    if cooldown_active {
        return transition(current, Mode::Cooldown, reason_codes::MODE_COOLDOWN_GATE);
    }
    if safety_level == SafetyLevel::HighRisk {
        return transition(current, Mode::Safety, reason_codes::MODE_SAFETY_HIGH_RISK);
    }
    match signal {
        DetectorSignal::Looping => {
            return transition(current, Mode::Regulate, reason_codes::MODE_REGULATE_LOOPING)
        }
        DetectorSignal::Escalating => {
            return transition(
                current,
                Mode::Regulate,
                reason_codes::MODE_REGULATE_ESCALATING,
            )
        }
        DetectorSignal::None => {}
    }

    if matches!(current, Mode::Safety | Mode::Cooldown) {
        return transition(current, Mode::Intake, reason_codes::MODE_RESOLVED_TO_INTAKE);
    }
    if let Some(request) = intent.explicit {
        return transition(current, request.mode(), reason_codes::MODE_EXPLICIT_REQUEST);
    }
    if current == Mode::Intake {
        return transition(current, Mode::Vent, reason_codes::MODE_INTAKE_PROGRESSION);
    }
    match intent.cue {
        IntentCue::NextSteps => transition(current, Mode::Plan, reason_codes::MODE_INFERRED_PLAN),
        IntentCue::StuckFeeling | IntentCue::Question => {
            transition(current, Mode::Reflect, reason_codes::MODE_INFERRED_REFLECT)
        }
        IntentCue::None => match current {
            Mode::Regulate => {
                transition(current, Mode::Vent, reason_codes::MODE_REGULATE_SETTLED)
            }
            Mode::Vent | Mode::Reflect | Mode::Plan => {
                transition(current, current, reason_codes::MODE_STAY)
            }
            // Handled above; kept so the match stays exhaustive.
            Mode::Intake | Mode::Safety | Mode::Cooldown => {
                transition(current, Mode::Vent, reason_codes::MODE_INTAKE_PROGRESSION)
            }
        },
    }
}

fn transition(from: Mode, to: Mode, reason_code: ReasonCodeId) -> ModeTransition {
    ModeTransition {
        schema_version: PH1MODE_CONTRACT_VERSION,
        from,
        to,
        allowed: to != Mode::Cooldown,
        reason_code,
    }
}
