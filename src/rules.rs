//! Tic-tac-toe rules engine.
//!
//! DESIGN
//! ======
//! Pure functions over value types: no I/O, no locks, no clocks. Both the
//! session coordinator (local pre-checks) and the game service (authoritative
//! validation before a write) call into this module, so move legality has a
//! single source of truth.
//!
//! A `Board` is immutable — applying a move produces a new board. Result
//! evaluation walks the eight winning lines in a fixed order and reports the
//! first match, which keeps the reported line deterministic.

use serde::{Deserialize, Serialize};

/// The eight 3-in-a-row lines on a 3x3 board, row-major indices 0..9.
/// Order is fixed: rows, columns, diagonals.
pub const WINNING_LINES: [[usize; 3]; 8] = [
    [0, 1, 2], // top row
    [3, 4, 5], // middle row
    [6, 7, 8], // bottom row
    [0, 3, 6], // left column
    [1, 4, 7], // center column
    [2, 5, 8], // right column
    [0, 4, 8], // diagonal
    [2, 4, 6], // anti-diagonal
];

// =============================================================================
// PLAYER
// =============================================================================

/// One of the two player symbols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Player {
    X,
    O,
}

impl Player {
    /// The opposing symbol. Applying twice returns the original.
    #[must_use]
    pub fn other(self) -> Self {
        match self {
            Self::X => Self::O,
            Self::O => Self::X,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::X => "X",
            Self::O => "O",
        }
    }
}

impl std::fmt::Display for Player {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single cell: occupied by a player or empty.
pub type CellValue = Option<Player>;

// =============================================================================
// BOARD
// =============================================================================

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum MoveError {
    #[error("cell index {0} is out of range")]
    OutOfRange(usize),
    #[error("cell {0} is already occupied")]
    Occupied(usize),
}

/// A 3x3 board as a flat row-major array of 9 cells.
///
/// Serializes as a JSON array of `"X"` / `"O"` / `null`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Board {
    cells: [CellValue; 9],
}

impl Board {
    /// All nine cells empty.
    #[must_use]
    pub fn empty() -> Self {
        Self { cells: [None; 9] }
    }

    /// The cell at `index`, or `None` if the index is out of range.
    #[must_use]
    pub fn cell(&self, index: usize) -> CellValue {
        self.cells.get(index).copied().flatten()
    }

    #[must_use]
    pub fn cells(&self) -> &[CellValue; 9] {
        &self.cells
    }

    /// A move is legal when the index is in `[0, 9)` and the cell is empty.
    /// An out-of-range index is an illegal move, not an error.
    #[must_use]
    pub fn is_valid_move(&self, index: usize) -> bool {
        index < self.cells.len() && self.cells[index].is_none()
    }

    /// Return a new board with `player` placed at `index`.
    ///
    /// Callers are expected to pre-validate with [`Board::is_valid_move`];
    /// this check is the last line of defense, and a failure here after
    /// validation indicates a broken caller.
    ///
    /// # Errors
    ///
    /// Returns `MoveError::OutOfRange` or `MoveError::Occupied`. The input
    /// board is never modified.
    pub fn apply_move(&self, index: usize, player: Player) -> Result<Self, MoveError> {
        if index >= self.cells.len() {
            return Err(MoveError::OutOfRange(index));
        }
        if self.cells[index].is_some() {
            return Err(MoveError::Occupied(index));
        }
        let mut cells = self.cells;
        cells[index] = Some(player);
        Ok(Self { cells })
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.cells.iter().all(Option::is_some)
    }

    /// Number of cells occupied by `player`.
    #[must_use]
    pub fn count(&self, player: Player) -> usize {
        self.cells.iter().filter(|c| **c == Some(player)).count()
    }
}

impl Default for Board {
    fn default() -> Self {
        Self::empty()
    }
}

// =============================================================================
// RESULT
// =============================================================================

/// Outcome of evaluating a board.
///
/// `Ongoing` is never persisted as a terminal result; it means "no result
/// yet". A forfeit win carries an empty `winning_line` because it was not
/// derived from the board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum GameResult {
    Win { winner: Player, winning_line: Vec<usize> },
    Draw,
    Ongoing,
}

impl GameResult {
    /// True for `Win` and `Draw`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Ongoing)
    }
}

/// Evaluate a board: first winning line in the fixed order, else draw when
/// full, else ongoing.
///
/// Two simultaneous winning lines cannot occur under one-move-at-a-time play,
/// but the fixed scan order keeps the answer deterministic regardless.
#[must_use]
pub fn evaluate(board: &Board) -> GameResult {
    for line in WINNING_LINES {
        let [a, b, c] = line;
        if let Some(player) = board.cell(a) {
            if board.cell(b) == Some(player) && board.cell(c) == Some(player) {
                return GameResult::Win { winner: player, winning_line: line.to_vec() };
            }
        }
    }

    if board.is_full() {
        return GameResult::Draw;
    }

    GameResult::Ongoing
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn board_from(moves: &[(usize, Player)]) -> Board {
        let mut board = Board::empty();
        for (index, player) in moves {
            board = board.apply_move(*index, *player).expect("legal move");
        }
        board
    }

    #[test]
    fn empty_board_has_nine_empty_cells() {
        let board = Board::empty();
        assert!(board.cells().iter().all(Option::is_none));
        assert!(!board.is_full());
    }

    #[test]
    fn other_is_involution() {
        assert_eq!(Player::X.other(), Player::O);
        assert_eq!(Player::O.other(), Player::X);
        assert_eq!(Player::X.other().other(), Player::X);
        assert_eq!(Player::O.other().other(), Player::O);
    }

    #[test]
    fn valid_move_requires_in_range_and_empty() {
        let board = board_from(&[(4, Player::X)]);
        assert!(board.is_valid_move(0));
        assert!(!board.is_valid_move(4));
        assert!(!board.is_valid_move(9));
        assert!(!board.is_valid_move(usize::MAX));
    }

    #[test]
    fn apply_move_returns_new_board() {
        let board = Board::empty();
        let next = board.apply_move(0, Player::X).unwrap();
        assert_eq!(board.cell(0), None);
        assert_eq!(next.cell(0), Some(Player::X));
    }

    #[test]
    fn apply_move_on_occupied_cell_fails_and_preserves_input() {
        let board = board_from(&[(3, Player::O)]);
        let before = board;
        let err = board.apply_move(3, Player::X).unwrap_err();
        assert_eq!(err, MoveError::Occupied(3));
        assert_eq!(board, before);
    }

    #[test]
    fn apply_move_out_of_range_fails() {
        let board = Board::empty();
        assert_eq!(board.apply_move(9, Player::X).unwrap_err(), MoveError::OutOfRange(9));
    }

    #[test]
    fn evaluate_empty_board_is_ongoing() {
        assert_eq!(evaluate(&Board::empty()), GameResult::Ongoing);
    }

    #[test]
    fn every_winning_line_is_detected() {
        for line in WINNING_LINES {
            let moves: Vec<(usize, Player)> = line.iter().map(|i| (*i, Player::O)).collect();
            let board = board_from(&moves);
            match evaluate(&board) {
                GameResult::Win { winner, winning_line } => {
                    assert_eq!(winner, Player::O);
                    assert_eq!(winning_line, line.to_vec());
                }
                other => panic!("expected win on line {line:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn completing_a_line_reports_win() {
        // X holds 0 and 1; placing at 2 completes the top row.
        let board = board_from(&[(0, Player::X), (3, Player::O), (1, Player::X), (4, Player::O)]);
        assert_eq!(evaluate(&board), GameResult::Ongoing);

        let finished = board.apply_move(2, Player::X).unwrap();
        assert_eq!(
            evaluate(&finished),
            GameResult::Win { winner: Player::X, winning_line: vec![0, 1, 2] }
        );
    }

    #[test]
    fn first_matching_line_wins_ties() {
        // Contrived double-line board: X on 0..=2 and 0,3,6. Row [0,1,2]
        // precedes column [0,3,6] in the scan order.
        let board = board_from(&[
            (0, Player::X),
            (1, Player::X),
            (2, Player::X),
            (3, Player::X),
            (6, Player::X),
        ]);
        match evaluate(&board) {
            GameResult::Win { winning_line, .. } => assert_eq!(winning_line, vec![0, 1, 2]),
            other => panic!("expected win, got {other:?}"),
        }
    }

    #[test]
    fn full_board_without_winner_is_draw() {
        // X O X / X O O / O X X
        let board = board_from(&[
            (0, Player::X),
            (1, Player::O),
            (2, Player::X),
            (3, Player::X),
            (4, Player::O),
            (5, Player::O),
            (6, Player::O),
            (7, Player::X),
            (8, Player::X),
        ]);
        assert_eq!(evaluate(&board), GameResult::Draw);
    }

    #[test]
    fn count_tracks_turn_alternation() {
        let board = board_from(&[(0, Player::X), (3, Player::O), (1, Player::X)]);
        assert_eq!(board.count(Player::X), 2);
        assert_eq!(board.count(Player::O), 1);
    }

    #[test]
    fn board_serde_round_trip() {
        let board = board_from(&[(0, Player::X), (4, Player::O)]);
        let json = serde_json::to_string(&board).unwrap();
        assert_eq!(json, r#"["X",null,null,null,"O",null,null,null,null]"#);
        let restored: Board = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, board);
    }

    #[test]
    fn result_serde_uses_type_tag() {
        let win = GameResult::Win { winner: Player::X, winning_line: vec![0, 1, 2] };
        let json = serde_json::to_value(&win).unwrap();
        assert_eq!(json["type"], "win");
        assert_eq!(json["winner"], "X");
        assert_eq!(json["winning_line"], serde_json::json!([0, 1, 2]));

        let draw = serde_json::to_value(GameResult::Draw).unwrap();
        assert_eq!(draw["type"], "draw");
    }

    #[test]
    fn forfeit_result_carries_empty_line() {
        let forfeit = GameResult::Win { winner: Player::O, winning_line: vec![] };
        assert!(forfeit.is_terminal());
        let json = serde_json::to_value(&forfeit).unwrap();
        assert_eq!(json["winning_line"], serde_json::json!([]));
    }
}
