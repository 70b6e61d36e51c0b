//! Virtual character grid driven by a `vte` parser.
//!
//! Only what redraw-in-place applications need is interpreted: cursor
//! positioning and movement, erase, insert/delete, scrolling and the
//! alternate screen. Attributes (SGR) and unknown sequences are dropped.

use vte::{Params, Perform};

const TAB_WIDTH: usize = 8;

/// A `width` x `height` screen of characters with a cursor.
#[derive(Debug, Clone)]
pub struct Grid {
    width: usize,
    height: usize,
    cells: Vec<Vec<char>>,
    row: usize,
    col: usize,
    saved: (usize, usize),
    /// Set after printing into the last column; the next print wraps.
    pending_wrap: bool,
}

impl Grid {
    /// Creates a blank grid. Zero dimensions are bumped to one.
    pub fn new(width: usize, height: usize) -> Self {
        let width = width.max(1);
        let height = height.max(1);
        Self {
            width,
            height,
            cells: vec![vec![' '; width]; height],
            row: 0,
            col: 0,
            saved: (0, 0),
            pending_wrap: false,
        }
    }

    /// Feeds raw bytes through a fresh `vte` parser.
    pub fn feed(&mut self, bytes: &[u8]) {
        let mut parser = vte::Parser::new();
        for byte in bytes {
            parser.advance(self, *byte);
        }
    }

    /// Cursor as `(row, col)`.
    pub fn cursor(&self) -> (usize, usize) {
        (self.row, self.col)
    }

    /// Rows as strings with trailing blanks removed.
    pub fn lines(&self) -> Vec<String> {
        self.cells
            .iter()
            .map(|row| row.iter().collect::<String>().trim_end().to_string())
            .collect()
    }

    fn blank_row(&self) -> Vec<char> {
        vec![' '; self.width]
    }

    fn goto(&mut self, row: usize, col: usize) {
        self.row = row.min(self.height - 1);
        self.col = col.min(self.width - 1);
        self.pending_wrap = false;
    }

    fn put(&mut self, c: char) {
        if self.pending_wrap {
            self.col = 0;
            self.linefeed();
            self.pending_wrap = false;
        }
        self.cells[self.row][self.col] = c;
        if self.col + 1 >= self.width {
            self.pending_wrap = true;
        } else {
            self.col += 1;
        }
    }

    fn linefeed(&mut self) {
        if self.row + 1 >= self.height {
            self.scroll_up(1);
        } else {
            self.row += 1;
        }
    }

    fn reverse_index(&mut self) {
        if self.row == 0 {
            self.scroll_down(1);
        } else {
            self.row -= 1;
        }
    }

    fn scroll_up(&mut self, n: usize) {
        for _ in 0..n.min(self.height) {
            self.cells.remove(0);
            self.cells.push(self.blank_row());
        }
    }

    fn scroll_down(&mut self, n: usize) {
        for _ in 0..n.min(self.height) {
            self.cells.pop();
            self.cells.insert(0, self.blank_row());
        }
    }

    fn clear_cells(&mut self, row: usize, from: usize, to: usize) {
        let to = to.min(self.width);
        for cell in &mut self.cells[row][from.min(to)..to] {
            *cell = ' ';
        }
    }

    fn erase_display(&mut self, mode: u16) {
        match mode {
            0 => {
                self.clear_cells(self.row, self.col, self.width);
                for row in self.row + 1..self.height {
                    self.clear_cells(row, 0, self.width);
                }
            }
            1 => {
                for row in 0..self.row {
                    self.clear_cells(row, 0, self.width);
                }
                self.clear_cells(self.row, 0, self.col + 1);
            }
            _ => {
                for row in 0..self.height {
                    self.clear_cells(row, 0, self.width);
                }
            }
        }
    }

    fn erase_line(&mut self, mode: u16) {
        match mode {
            0 => self.clear_cells(self.row, self.col, self.width),
            1 => self.clear_cells(self.row, 0, self.col + 1),
            _ => self.clear_cells(self.row, 0, self.width),
        }
    }

    fn delete_chars(&mut self, n: usize) {
        let row = &mut self.cells[self.row];
        let n = n.min(self.width - self.col);
        row.drain(self.col..self.col + n);
        row.extend(std::iter::repeat(' ').take(n));
    }

    fn insert_chars(&mut self, n: usize) {
        let width = self.width;
        let row = &mut self.cells[self.row];
        let n = n.min(width - self.col);
        for _ in 0..n {
            row.insert(self.col, ' ');
        }
        row.truncate(width);
    }

    fn insert_lines(&mut self, n: usize) {
        for _ in 0..n.min(self.height - self.row) {
            self.cells.pop();
            self.cells.insert(self.row, self.blank_row());
        }
    }

    fn delete_lines(&mut self, n: usize) {
        for _ in 0..n.min(self.height - self.row) {
            self.cells.remove(self.row);
            self.cells.push(self.blank_row());
        }
    }

    fn reset(&mut self) {
        *self = Grid::new(self.width, self.height);
    }
}

/// First value of parameter `index`, or `default` when absent or zero.
fn arg(params: &Params, index: usize, default: u16) -> usize {
    params
        .iter()
        .nth(index)
        .and_then(|p| p.first().copied())
        .filter(|&v| v != 0)
        .unwrap_or(default) as usize
}

/// Raw first value of parameter `index` (zero is meaningful for erase modes).
fn raw_arg(params: &Params, index: usize) -> u16 {
    params
        .iter()
        .nth(index)
        .and_then(|p| p.first().copied())
        .unwrap_or(0)
}

impl Perform for Grid {
    fn print(&mut self, c: char) {
        self.put(c);
    }

    fn execute(&mut self, byte: u8) {
        match byte {
            // LF also returns to column 0: captures and line streams rarely
            // carry the CR.
            b'\n' | 0x0b | 0x0c => {
                self.col = 0;
                self.pending_wrap = false;
                self.linefeed();
            }
            b'\r' => {
                self.col = 0;
                self.pending_wrap = false;
            }
            0x08 => {
                self.col = self.col.saturating_sub(1);
                self.pending_wrap = false;
            }
            b'\t' => {
                let next = (self.col / TAB_WIDTH + 1) * TAB_WIDTH;
                self.col = next.min(self.width - 1);
            }
            _ => {}
        }
    }

    fn csi_dispatch(&mut self, params: &Params, intermediates: &[u8], ignore: bool, action: char) {
        if ignore {
            return;
        }

        if intermediates.first() == Some(&b'?') {
            // Alternate screen switches start from a blank grid.
            if matches!(action, 'h' | 'l')
                && matches!(raw_arg(params, 0), 47 | 1047 | 1049)
            {
                self.erase_display(2);
                self.goto(0, 0);
            }
            return;
        }

        let (row, col) = (self.row, self.col);
        match action {
            'H' | 'f' => self.goto(arg(params, 0, 1) - 1, arg(params, 1, 1) - 1),
            'A' => self.goto(row.saturating_sub(arg(params, 0, 1)), col),
            'B' | 'e' => self.goto(row + arg(params, 0, 1), col),
            'C' | 'a' => self.goto(row, col + arg(params, 0, 1)),
            'D' => self.goto(row, col.saturating_sub(arg(params, 0, 1))),
            'E' => self.goto(row + arg(params, 0, 1), 0),
            'F' => self.goto(row.saturating_sub(arg(params, 0, 1)), 0),
            'G' | '`' => self.goto(row, arg(params, 0, 1) - 1),
            'd' => self.goto(arg(params, 0, 1) - 1, col),
            'J' => self.erase_display(raw_arg(params, 0)),
            'K' => self.erase_line(raw_arg(params, 0)),
            'X' => self.clear_cells(row, col, col + arg(params, 0, 1)),
            'P' => self.delete_chars(arg(params, 0, 1)),
            '@' => self.insert_chars(arg(params, 0, 1)),
            'L' => self.insert_lines(arg(params, 0, 1)),
            'M' => self.delete_lines(arg(params, 0, 1)),
            'S' => self.scroll_up(arg(params, 0, 1)),
            'T' => self.scroll_down(arg(params, 0, 1)),
            's' => self.saved = (row, col),
            'u' => {
                let (r, c) = self.saved;
                self.goto(r, c);
            }
            _ => {}
        }
    }

    fn esc_dispatch(&mut self, _intermediates: &[u8], ignore: bool, byte: u8) {
        if ignore {
            return;
        }
        match byte {
            b'7' => self.saved = (self.row, self.col),
            b'8' => {
                let (r, c) = self.saved;
                self.goto(r, c);
            }
            b'D' => self.linefeed(),
            b'E' => {
                self.col = 0;
                self.linefeed();
            }
            b'M' => self.reverse_index(),
            b'c' => self.reset(),
            _ => {}
        }
    }
}
