//! Move generation and validation: the rules engine.
//!
//! Everything here is a pure function over a [`Position`] (or its
//! [`Board`]): nothing mutates its argument, and illegal input is reported
//! as [`EngineError::IllegalMove`] instead of panicking. It handles:
//!
//! - Piece movement patterns (King, Queen, Rook, Bishop, Knight, Pawn)
//! - Castling (kingside and queenside, with all conditions)
//! - En passant captures
//! - Pawn promotion
//! - Check detection and prevention (no move may leave own king in check)
//! - Checkmate, stalemate, insufficient material and repetition tests
//! - Disambiguation data for algebraic notation

use crate::error::{EngineError, EngineResult};
use crate::position::Position;
use crate::types::*;

// ---------------------------------------------------------------------------
// Attack detection
// ---------------------------------------------------------------------------

const KNIGHT_OFFSETS: [(i8, i8); 8] = [
    (-2, -1), (-2, 1), (-1, -2), (-1, 2),
    (1, -2), (1, 2), (2, -1), (2, 1),
];

/// Direction vectors for sliding pieces.
const ROOK_DIRS: [(i8, i8); 4] = [(-1, 0), (1, 0), (0, -1), (0, 1)];
const BISHOP_DIRS: [(i8, i8); 4] = [(-1, -1), (-1, 1), (1, -1), (1, 1)];
const QUEEN_DIRS: [(i8, i8); 8] = [
    (-1, 0), (1, 0), (0, -1), (0, 1),
    (-1, -1), (-1, 1), (1, -1), (1, 1),
];

/// Returns `true` if the given square is attacked by any piece of `attacker_color`.
///
/// This is used for:
/// - Check detection (is the king attacked?)
/// - Castling validation (king must not pass through or land on attacked squares)
pub fn is_square_attacked(board: &Board, sq: Square, attacker_color: Color) -> bool {
    let attacker_at = |from: Square, kinds: &[PieceKind]| {
        matches!(board.get(from), Some(p) if p.color == attacker_color && kinds.contains(&p.kind))
    };

    for &(df, dr) in &KNIGHT_OFFSETS {
        if let Some(from) = sq.offset(df, dr)
            && attacker_at(from, &[PieceKind::Knight])
        {
            return true;
        }
    }

    for &(df, dr) in &QUEEN_DIRS {
        if let Some(from) = sq.offset(df, dr)
            && attacker_at(from, &[PieceKind::King])
        {
            return true;
        }
    }

    // The attacking pawn sits one rank behind the target from its own point of view.
    let pawn_dir = attacker_color.pawn_direction();
    for df in [-1i8, 1] {
        if let Some(from) = sq.offset(df, -pawn_dir)
            && attacker_at(from, &[PieceKind::Pawn])
        {
            return true;
        }
    }

    let rays: [(&[(i8, i8)], [PieceKind; 2]); 2] = [
        (&BISHOP_DIRS, [PieceKind::Bishop, PieceKind::Queen]),
        (&ROOK_DIRS, [PieceKind::Rook, PieceKind::Queen]),
    ];
    for (dirs, sliders) in rays {
        for &(df, dr) in dirs {
            let mut cur = sq;
            while let Some(next) = cur.offset(df, dr) {
                if board.get(next).is_some() {
                    if attacker_at(next, &sliders) {
                        return true;
                    }
                    break; // blocked by another piece
                }
                cur = next;
            }
        }
    }

    false
}

/// Returns `true` if `side`'s king, standing on `king_sq`, is attacked.
pub fn is_king_attacked(board: &Board, side: Color, king_sq: Square) -> bool {
    is_square_attacked(board, king_sq, side.opponent())
}

/// Returns `true` if the king of the given color is currently in check.
pub fn is_in_check(board: &Board, color: Color) -> bool {
    match board.find_king(color) {
        Some(king_sq) => is_king_attacked(board, color, king_sq),
        // No king found: never happens for a decoded or played position
        None => false,
    }
}

// ---------------------------------------------------------------------------
// Pseudo-legal move generation (before check filtering)
// ---------------------------------------------------------------------------

/// Generates all pseudo-legal moves for `side`.
///
/// "Pseudo-legal" means the moves follow piece movement rules but may leave
/// the own king in check. [`generate_legal_moves_for`] filters those out.
fn generate_pseudo_legal_moves(
    board: &Board,
    side: Color,
    castling: &CastlingRights,
    en_passant: Option<Square>,
) -> Vec<ChessMove> {
    let mut moves = Vec::with_capacity(64);

    for (from, piece) in board.pieces() {
        if piece.color != side {
            continue;
        }
        generate_piece_moves(board, from, piece, castling, en_passant, &mut moves);
    }

    moves
}

/// Generates the pseudo-legal moves of the single piece on `from`.
fn generate_piece_moves(
    board: &Board,
    from: Square,
    piece: Piece,
    castling: &CastlingRights,
    en_passant: Option<Square>,
    moves: &mut Vec<ChessMove>,
) {
    let color = piece.color;
    match piece.kind {
        PieceKind::King => generate_king_moves(board, from, color, castling, moves),
        PieceKind::Queen => generate_sliding_moves(board, from, color, &QUEEN_DIRS, moves),
        PieceKind::Rook => generate_sliding_moves(board, from, color, &ROOK_DIRS, moves),
        PieceKind::Bishop => generate_sliding_moves(board, from, color, &BISHOP_DIRS, moves),
        PieceKind::Knight => generate_knight_moves(board, from, color, moves),
        PieceKind::Pawn => generate_pawn_moves(board, from, color, en_passant, moves),
    }
}

/// Generates sliding piece moves (rook, bishop, queen).
fn generate_sliding_moves(
    board: &Board,
    from: Square,
    color: Color,
    directions: &[(i8, i8)],
    moves: &mut Vec<ChessMove>,
) {
    for &(df, dr) in directions {
        let mut cur = from;
        while let Some(to) = cur.offset(df, dr) {
            match board.get(to) {
                None => {
                    moves.push(ChessMove::simple(from, to));
                    cur = to;
                }
                Some(target) => {
                    if target.color != color {
                        moves.push(ChessMove::simple(from, to)); // capture
                    }
                    break; // blocked
                }
            }
        }
    }
}

/// Generates knight moves.
fn generate_knight_moves(board: &Board, from: Square, color: Color, moves: &mut Vec<ChessMove>) {
    for &(df, dr) in &KNIGHT_OFFSETS {
        if let Some(to) = from.offset(df, dr)
            && board.get(to).is_none_or(|target| target.color != color)
        {
            moves.push(ChessMove::simple(from, to));
        }
    }
}

/// Generates king moves (including castling).
fn generate_king_moves(
    board: &Board,
    from: Square,
    color: Color,
    castling: &CastlingRights,
    moves: &mut Vec<ChessMove>,
) {
    for &(df, dr) in &QUEEN_DIRS {
        if let Some(to) = from.offset(df, dr)
            && board.get(to).is_none_or(|target| target.color != color)
        {
            moves.push(ChessMove::simple(from, to));
        }
    }

    // Castling
    let rights = castling.for_color(color);
    let rank = color.back_rank();
    let king_start = Square::new(4, rank);

    // Only attempt castling if king is on its starting square
    if from != king_start {
        return;
    }

    // King must not be in check to castle
    if is_square_attacked(board, from, color.opponent()) {
        return;
    }

    let rook_present = |file: u8| {
        matches!(
            board.get(Square::new(file, rank)),
            Some(Piece { kind: PieceKind::Rook, color: c }) if c == color
        )
    };
    let empty = |files: &[u8]| files.iter().all(|&f| board.get(Square::new(f, rank)).is_none());
    // King must not pass through or land on attacked squares
    let safe = |files: &[u8]| {
        files
            .iter()
            .all(|&f| !is_square_attacked(board, Square::new(f, rank), color.opponent()))
    };

    if rights.kingside && rook_present(7) && empty(&[5, 6]) && safe(&[5, 6]) {
        moves.push(ChessMove {
            from,
            to: Square::new(6, rank),
            promotion: None,
            is_castling: true,
            is_en_passant: false,
        });
    }

    // b1/b8 must be empty but does not need to be safe; only the king's path d,c
    if rights.queenside && rook_present(0) && empty(&[1, 2, 3]) && safe(&[3, 2]) {
        moves.push(ChessMove {
            from,
            to: Square::new(2, rank),
            promotion: None,
            is_castling: true,
            is_en_passant: false,
        });
    }
}

/// Generates pawn moves (forward, captures, en passant, promotion).
fn generate_pawn_moves(
    board: &Board,
    from: Square,
    color: Color,
    en_passant: Option<Square>,
    moves: &mut Vec<ChessMove>,
) {
    let dir = color.pawn_direction();
    let start_rank = color.pawn_start_rank();
    let promo_rank = color.promotion_rank();

    // Helper to add moves (with promotion variants if applicable)
    let mut add_move = |to: Square, is_ep: bool| {
        if to.rank == promo_rank {
            for kind in [PieceKind::Queen, PieceKind::Rook, PieceKind::Bishop, PieceKind::Knight] {
                moves.push(ChessMove {
                    from,
                    to,
                    promotion: Some(kind),
                    is_castling: false,
                    is_en_passant: false,
                });
            }
        } else {
            moves.push(ChessMove {
                from,
                to,
                promotion: None,
                is_castling: false,
                is_en_passant: is_ep,
            });
        }
    };

    // Single step forward
    if let Some(one_ahead) = from.offset(0, dir)
        && board.get(one_ahead).is_none()
    {
        add_move(one_ahead, false);

        // Double step from starting rank
        if from.rank == start_rank
            && let Some(two_ahead) = from.offset(0, dir * 2)
            && board.get(two_ahead).is_none()
        {
            add_move(two_ahead, false);
        }
    }

    // Diagonal captures
    for df in [-1i8, 1] {
        if let Some(to) = from.offset(df, dir) {
            if let Some(target) = board.get(to)
                && target.color != color
            {
                add_move(to, false);
            }

            if en_passant == Some(to) {
                add_move(to, true);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Legal move generation (with check filtering)
// ---------------------------------------------------------------------------

/// Generates all legal moves for `side` on the given board.
///
/// A legal move is a pseudo-legal move that does not leave or place
/// the own king in check.
pub fn generate_legal_moves_for(
    board: &Board,
    side: Color,
    castling: &CastlingRights,
    en_passant: Option<Square>,
) -> Vec<ChessMove> {
    generate_pseudo_legal_moves(board, side, castling, en_passant)
        .into_iter()
        .filter(|mv| leaves_king_safe(board, mv, side))
        .collect()
}

/// Generates all legal moves for the side to move.
pub fn generate_legal_moves(pos: &Position) -> Vec<ChessMove> {
    generate_legal_moves_for(&pos.board, pos.turn, &pos.castling, pos.en_passant)
}

/// Legal moves for `side` in `pos`, whether or not `side` is to move.
/// The en passant target only exists for the side to move.
fn legal_moves_of_side(pos: &Position, side: Color) -> Vec<ChessMove> {
    let en_passant = if side == pos.turn { pos.en_passant } else { None };
    generate_legal_moves_for(&pos.board, side, &pos.castling, en_passant)
}

/// Legal moves of the piece standing on `from` (side to move only).
pub fn legal_moves_from(pos: &Position, from: Square) -> Vec<ChessMove> {
    let piece = match pos.board.get(from) {
        Some(p) if p.color == pos.turn => p,
        _ => return Vec::new(),
    };
    let mut moves = Vec::new();
    generate_piece_moves(&pos.board, from, piece, &pos.castling, pos.en_passant, &mut moves);
    moves.retain(|mv| leaves_king_safe(&pos.board, mv, pos.turn));
    moves
}

fn leaves_king_safe(board: &Board, mv: &ChessMove, side: Color) -> bool {
    let mut test_board = board.clone();
    apply_move_to_board(&mut test_board, mv, side);
    !is_in_check(&test_board, side)
}

/// Applies a move to a board (mutating it). Used on scratch copies for
/// legality testing and by [`apply_move`].
///
/// This handles:
/// - Normal moves and captures
/// - Castling (moves both king and rook)
/// - En passant (removes the captured pawn)
/// - Promotion (replaces pawn with promoted piece)
pub fn apply_move_to_board(board: &mut Board, mv: &ChessMove, color: Color) {
    let Some(piece) = board.get(mv.from) else {
        return;
    };

    board.set(mv.from, None);

    if mv.is_en_passant {
        let captured = Square::new(mv.to.file, (mv.to.rank as i8 - color.pawn_direction()) as u8);
        board.set(captured, None);
    }

    let placed_piece = match mv.promotion {
        Some(promo_kind) => Piece::new(promo_kind, color),
        None => piece,
    };
    board.set(mv.to, Some(placed_piece));

    match mv.castle_side() {
        Some(CastleSide::Kingside) => {
            let rank = mv.from.rank;
            let rook = board.get(Square::new(7, rank));
            board.set(Square::new(7, rank), None);
            board.set(Square::new(5, rank), rook);
        }
        Some(CastleSide::Queenside) => {
            let rank = mv.from.rank;
            let rook = board.get(Square::new(0, rank));
            board.set(Square::new(0, rank), None);
            board.set(Square::new(3, rank), rook);
        }
        None => {}
    }
}

/// Returns the piece a move captures, if any (en passant included).
pub fn captured_piece(pos: &Position, mv: &ChessMove) -> Option<Piece> {
    if mv.is_en_passant {
        let sq = Square::new(mv.to.file, mv.from.rank);
        pos.board.get(sq)
    } else {
        pos.board.get(mv.to)
    }
}

/// Produces the position reached by playing `mv` (assumed legal) from `pos`.
///
/// Updates castling rights, the en passant target, both move counters and
/// the side to move. `pos` itself is left untouched.
pub fn apply_move(pos: &Position, mv: &ChessMove) -> Position {
    let mut next = pos.clone();
    let mover = pos.turn;

    let is_pawn_move = matches!(pos.board.get(mv.from), Some(p) if p.kind == PieceKind::Pawn);
    let is_capture = captured_piece(pos, mv).is_some();

    apply_move_to_board(&mut next.board, mv, mover);

    // King move: lose all castling rights for that side
    if matches!(pos.board.get(mv.from), Some(p) if p.kind == PieceKind::King) {
        *next.castling.for_color_mut(mover) = SideCastlingRights::none();
    }

    // A rook moving from, or being captured on, its starting square
    let clear_rook_square = |sq: Square, castling: &mut CastlingRights| {
        for color in [Color::White, Color::Black] {
            let rank = color.back_rank();
            if sq == Square::new(7, rank) {
                castling.for_color_mut(color).kingside = false;
            }
            if sq == Square::new(0, rank) {
                castling.for_color_mut(color).queenside = false;
            }
        }
    };
    clear_rook_square(mv.from, &mut next.castling);
    clear_rook_square(mv.to, &mut next.castling);

    next.en_passant = None;
    if is_pawn_move && (mv.to.rank as i8 - mv.from.rank as i8).abs() == 2 {
        let ep_rank = (mv.from.rank as i8 + mover.pawn_direction()) as u8;
        next.en_passant = Some(Square::new(mv.from.file, ep_rank));
    }

    if is_pawn_move || is_capture {
        next.halfmove_clock = 0;
    } else {
        next.halfmove_clock += 1;
    }

    next.turn = mover.opponent();
    if next.turn == Color::White {
        next.fullmove_number += 1;
    }

    next
}

// ---------------------------------------------------------------------------
// Legality
// ---------------------------------------------------------------------------

/// Resolves a requested move against the legal moves of `pos`.
///
/// A pawn reaching the far rank promotes to `promotion`, or to a queen when
/// no choice is given; a promotion choice on any other move is ignored.
/// Castling and en passant flags are filled in from the matching legal move.
pub fn validate_move(
    pos: &Position,
    from: Square,
    to: Square,
    promotion: Option<PieceKind>,
) -> EngineResult<ChessMove> {
    if from == to {
        return Err(EngineError::IllegalMove(format!("{} to itself", from)));
    }

    let piece = match pos.board.get(from) {
        None => return Err(EngineError::IllegalMove(format!("no piece on {}", from))),
        Some(p) if p.color != pos.turn => {
            return Err(EngineError::IllegalMove(format!(
                "piece on {} belongs to {}, but it is {}'s turn",
                from, p.color, pos.turn
            )));
        }
        Some(p) => p,
    };

    let promotion = if piece.kind == PieceKind::Pawn && to.rank == piece.color.promotion_rank() {
        let kind = promotion.unwrap_or(PieceKind::Queen);
        if !kind.is_promotion_target() {
            return Err(EngineError::IllegalMove(format!(
                "cannot promote to {:?}",
                kind
            )));
        }
        Some(kind)
    } else {
        None
    };

    legal_moves_from(pos, from)
        .into_iter()
        .find(|m| m.to == to && m.promotion == promotion)
        .ok_or_else(|| EngineError::IllegalMove(format!("{}{} is not legal", from, to)))
}

/// Legal move test: `true` iff the piece on `from` may move to `to`.
pub fn is_legal(pos: &Position, from: Square, to: Square, promotion: Option<PieceKind>) -> bool {
    validate_move(pos, from, to, promotion).is_ok()
}

/// Parses a coordinate move (`e2e4`, `e7e8=Q`, `e7e8q`) and validates it.
pub fn parse_coordinate_move(pos: &Position, text: &str) -> EngineResult<ChessMove> {
    let text = text.trim();
    let bad = || EngineError::IllegalMove(format!("cannot parse move '{}'", text));
    if text.len() < 4 || !text.is_ascii() {
        return Err(bad());
    }
    let from = Square::from_algebraic(&text[0..2]).ok_or_else(bad)?;
    let to = Square::from_algebraic(&text[2..4]).ok_or_else(bad)?;
    let rest = text[4..].trim_start_matches('=');
    let promotion = if rest.is_empty() {
        None
    } else {
        Some(PieceKind::from_promotion_letter(rest).ok_or_else(bad)?)
    };
    validate_move(pos, from, to, promotion)
}

// ---------------------------------------------------------------------------
// Terminal conditions
// ---------------------------------------------------------------------------

/// `true` iff `side` is in check and has no legal move that escapes it.
pub fn is_checkmate(pos: &Position, side: Color) -> bool {
    is_in_check(&pos.board, side) && legal_moves_of_side(pos, side).is_empty()
}

/// `true` iff `side` is not in check and has no legal moves.
pub fn is_stalemate(pos: &Position, side: Color) -> bool {
    !is_in_check(&pos.board, side) && legal_moves_of_side(pos, side).is_empty()
}

/// Checks if the position has insufficient material for checkmate.
///
/// Returns `true` for "dead positions":
/// - K vs K
/// - K+B vs K
/// - K+N vs K
/// - K+B vs K+B (both bishops on same color squares)
pub fn is_insufficient_material(board: &Board) -> bool {
    let mut white_minor: Vec<(PieceKind, Square)> = Vec::new();
    let mut black_minor: Vec<(PieceKind, Square)> = Vec::new();

    for (sq, piece) in board.pieces() {
        if piece.kind == PieceKind::King {
            continue;
        }
        match piece.color {
            Color::White => white_minor.push((piece.kind, sq)),
            Color::Black => black_minor.push((piece.kind, sq)),
        }
    }

    let is_minor = |kind: PieceKind| kind == PieceKind::Bishop || kind == PieceKind::Knight;

    match (white_minor.as_slice(), black_minor.as_slice()) {
        ([], []) => true,
        ([(kind, _)], []) | ([], [(kind, _)]) => is_minor(*kind),
        ([(PieceKind::Bishop, wsq)], [(PieceKind::Bishop, bsq)]) => wsq.is_light() == bsq.is_light(),
        _ => false,
    }
}

/// Reduced repetition key of a FEN snapshot (drops the two counters).
fn repetition_key_of(fen: &str) -> String {
    fen.split_whitespace().take(4).collect::<Vec<_>>().join(" ")
}

/// How many times the last snapshot's reduced position occurs in `snapshots`.
pub fn count_repetitions(snapshots: &[String]) -> usize {
    let Some(current) = snapshots.last() else {
        return 0;
    };
    let key = repetition_key_of(current);
    snapshots
        .iter()
        .filter(|fen| repetition_key_of(fen) == key)
        .count()
}

/// The current position has occurred at least three times.
pub fn is_threefold_repetition(snapshots: &[String]) -> bool {
    count_repetitions(snapshots) >= 3
}

/// The current position has occurred at least five times.
pub fn is_fivefold_repetition(snapshots: &[String]) -> bool {
    count_repetitions(snapshots) >= 5
}

// ---------------------------------------------------------------------------
// Disambiguation
// ---------------------------------------------------------------------------

/// Other same-kind pieces that could also legally reach the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Disambiguation {
    /// At least one rival stands on the mover's file.
    pub same_file: bool,
    /// At least one rival stands on the mover's rank.
    pub same_rank: bool,
}

/// Reports whether algebraic notation for `mv` needs an origin file, rank or
/// both. Returns `None` when no other piece of the same kind and color can
/// legally move to `mv.to`. Pawns never need this.
pub fn find_duplicate_movement(pos: &Position, mv: &ChessMove) -> Option<Disambiguation> {
    let piece = pos.board.get(mv.from)?;
    if piece.kind == PieceKind::Pawn || piece.kind == PieceKind::King {
        return None;
    }

    let rivals: Vec<Square> = pos
        .board
        .pieces()
        .filter(|(sq, p)| *sq != mv.from && *p == piece)
        .filter(|(sq, _)| legal_moves_from(pos, *sq).iter().any(|m| m.to == mv.to))
        .map(|(sq, _)| sq)
        .collect();

    if rivals.is_empty() {
        return None;
    }

    Some(Disambiguation {
        same_file: rivals.iter().any(|sq| sq.file == mv.from.file),
        same_rank: rivals.iter().any(|sq| sq.rank == mv.from.rank),
    })
}
