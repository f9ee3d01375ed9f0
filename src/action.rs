use std::fmt;

/// Number of buttons on a Genesis pad, in the simulator's wire order.
pub const BUTTON_COUNT: usize = 12;

/// Number of distinct discrete actions the agent can take.
///
/// The action space is a 3x3 direction grid (up/neutral/down crossed with
/// left/neutral/right) crossed with the jump button: even indices press no
/// jump, odd indices add it, and the grid cell is `index / 2` in row-major
/// order. Index 8 is therefore the empty pad and index 9 is jump alone.
pub const ACTION_COUNT: usize = 18;

/// A full pad state: one 0/1 flag per button, several may be asserted.
pub type ControlVector = [u8; BUTTON_COUNT];

pub const BTN_JUMP: usize = 0; // "B"; any of A/B/C jumps in-game
pub const BTN_UP: usize = 4;
pub const BTN_DOWN: usize = 5;
pub const BTN_LEFT: usize = 6;
pub const BTN_RIGHT: usize = 7;

const BUTTON_NAMES: [&str; BUTTON_COUNT] = [
    "B", "A", "MODE", "START", "UP", "DOWN", "LEFT", "RIGHT", "C", "Y", "X", "Z",
];

/// Maps an action index to the pad state it stands for.
///
/// Total over `[0, ACTION_COUNT)` and injective: no two indices produce the
/// same control vector. An out-of-range index is a programming error.
pub fn decode(index: usize) -> ControlVector {
    assert!(
        index < ACTION_COUNT,
        "action index {index} out of range (0..{ACTION_COUNT})"
    );
    let mut controls = [0u8; BUTTON_COUNT];
    let direction = index / 2;
    match direction / 3 {
        0 => controls[BTN_UP] = 1,
        2 => controls[BTN_DOWN] = 1,
        _ => {}
    }
    match direction % 3 {
        0 => controls[BTN_LEFT] = 1,
        2 => controls[BTN_RIGHT] = 1,
        _ => {}
    }
    if index % 2 == 1 {
        controls[BTN_JUMP] = 1;
    }
    controls
}

/// Reverse lookup of [`decode`], for display and diagnostics only.
pub fn encode(controls: &ControlVector) -> Option<usize> {
    (0..ACTION_COUNT).find(|&i| decode(i) == *controls)
}

/// Whether the decoded pad state holds RIGHT, i.e. the action runs toward
/// the goal. Used to seed the initial right-running bias.
pub fn presses_right(index: usize) -> bool {
    decode(index)[BTN_RIGHT] == 1
}

/// Human-readable form of an action index, e.g. `UP+RIGHT+B` or `NOOP`.
pub struct ActionLabel(pub usize);

impl fmt::Display for ActionLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let controls = decode(self.0);
        let mut first = true;
        for (i, &pressed) in controls.iter().enumerate() {
            if pressed == 1 {
                if !first {
                    write!(f, "+")?;
                }
                write!(f, "{}", BUTTON_NAMES[i])?;
                first = false;
            }
        }
        if first {
            write!(f, "NOOP")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn decode_is_injective() {
        let vectors: HashSet<ControlVector> = (0..ACTION_COUNT).map(decode).collect();
        assert_eq!(vectors.len(), ACTION_COUNT);
    }

    #[test]
    fn encode_inverts_decode() {
        for i in 0..ACTION_COUNT {
            assert_eq!(encode(&decode(i)), Some(i));
        }
    }

    #[test]
    fn index_8_is_empty_pad() {
        assert_eq!(decode(8), [0u8; BUTTON_COUNT]);
    }

    #[test]
    fn index_9_is_jump_alone() {
        let neutral = decode(8);
        let jump = decode(9);
        let differing: Vec<usize> = (0..BUTTON_COUNT).filter(|&b| neutral[b] != jump[b]).collect();
        assert_eq!(differing, vec![BTN_JUMP]);
        assert_eq!(jump[BTN_JUMP], 1);
    }

    #[test]
    fn diagonals_press_two_directions() {
        // index 0: up-left grid cell, no jump
        let controls = decode(0);
        assert_eq!(controls[BTN_UP], 1);
        assert_eq!(controls[BTN_LEFT], 1);
        assert_eq!(controls[BTN_JUMP], 0);
    }

    #[test]
    fn right_running_actions() {
        let right: Vec<usize> = (0..ACTION_COUNT).filter(|&i| presses_right(i)).collect();
        // direction columns 2, 5, 8 of the grid, with and without jump
        assert_eq!(right, vec![4, 5, 10, 11, 16, 17]);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn out_of_range_index_panics() {
        decode(ACTION_COUNT);
    }

    #[test]
    fn labels_read_naturally() {
        assert_eq!(ActionLabel(8).to_string(), "NOOP");
        assert_eq!(ActionLabel(9).to_string(), "B");
        assert_eq!(ActionLabel(4).to_string(), "UP+RIGHT");
    }
}
