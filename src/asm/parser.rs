//! Listing parser implementation.

use super::{ParseError, ParseResult};
use crate::lower::{CmpOp, CodeUnit, Const, Instr, Opcode, OperandKind};
use std::collections::HashMap;

/// Parse every code unit in `text`.
pub fn parse_module(text: &str) -> ParseResult<Vec<CodeUnit>> {
    let mut parser = Parser::new(text);
    parser.parse()
}

struct Parser<'a> {
    text: &'a str,
    pos: usize,

    // Per-unit label resolution
    labels: HashMap<&'a str, usize>,
    jump_resolves: Vec<(usize, &'a str, usize)>,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            text,
            pos: 0,
            labels: HashMap::new(),
            jump_resolves: Vec::new(),
        }
    }

    fn line(&self) -> usize {
        self.text[..self.pos.min(self.text.len())].matches('\n').count() + 1
    }

    fn error<T>(&self, message: impl Into<String>) -> ParseResult<T> {
        Err(ParseError {
            line: self.line(),
            message: message.into(),
        })
    }

    fn parse(&mut self) -> ParseResult<Vec<CodeUnit>> {
        let mut units = Vec::new();
        self.skip_whitespace(true);
        while !self.is_eof() {
            let keyword = self.read_identifier()?;
            if keyword != "code" {
                return self.error(format!("expected `code`, found `{}`", keyword));
            }
            let unit = self.parse_unit()?;
            if units.iter().any(|u: &CodeUnit| u.name == unit.name) {
                return self.error(format!("duplicate code unit `{}`", unit.name));
            }
            units.push(unit);
            self.skip_whitespace(true);
        }
        Ok(units)
    }

    fn is_eof(&self) -> bool {
        self.pos >= self.text.len()
    }

    fn current_char(&self) -> Option<char> {
        self.text[self.pos..].chars().next()
    }

    fn advance(&mut self) {
        if let Some(ch) = self.current_char() {
            self.pos += ch.len_utf8();
        }
    }

    fn skip_whitespace(&mut self, skip_newlines: bool) {
        while let Some(ch) = self.current_char() {
            if ch == ';' {
                // Comment runs to the end of the line
                while let Some(ch) = self.current_char() {
                    if ch == '\n' {
                        break;
                    }
                    self.advance();
                }
            } else if ch.is_whitespace() {
                if ch == '\n' && !skip_newlines {
                    break;
                }
                self.advance();
            } else {
                break;
            }
        }
    }

    fn try_read(&mut self, ch: char) -> bool {
        self.skip_whitespace(false);
        if self.current_char() == Some(ch) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, ch: char) -> ParseResult<()> {
        if !self.try_read(ch) {
            return self.error(format!("expected '{}' but found {:?}", ch, self.current_char()));
        }
        Ok(())
    }

    fn at_line_end(&mut self) -> bool {
        self.skip_whitespace(false);
        matches!(self.current_char(), None | Some('\n'))
    }

    fn read_while(&mut self, accept: impl Fn(char) -> bool) -> &'a str {
        let start = self.pos;
        while let Some(ch) = self.current_char() {
            if accept(ch) {
                self.advance();
            } else {
                break;
            }
        }
        &self.text[start..self.pos]
    }

    fn read_identifier(&mut self) -> ParseResult<&'a str> {
        self.skip_whitespace(false);
        match self.current_char() {
            Some(ch) if ch.is_alphabetic() || ch == '_' => {}
            Some(ch) => return self.error(format!("expected identifier but found '{}'", ch)),
            None => return self.error("expected identifier but found end of input"),
        }
        Ok(self.read_while(|ch| ch.is_alphanumeric() || ch == '_'))
    }

    fn read_integer(&mut self) -> ParseResult<i64> {
        self.skip_whitespace(false);
        let negative = self.try_read('-');
        let digits = if self.text[self.pos..].starts_with("0x") || self.text[self.pos..].starts_with("0X") {
            self.pos += 2;
            let hex = self.read_while(|ch| ch.is_ascii_hexdigit());
            i64::from_str_radix(hex, 16)
        } else {
            let dec = self.read_while(|ch| ch.is_ascii_digit());
            if dec.is_empty() {
                return self.error(format!("expected number but found {:?}", self.current_char()));
            }
            dec.parse::<i64>()
        };
        match digits {
            Ok(v) if negative => Ok(-v),
            Ok(v) => Ok(v),
            Err(e) => self.error(format!("bad number: {}", e)),
        }
    }

    /// Comma- or space-separated identifiers up to the end of the line.
    fn read_name_list(&mut self) -> ParseResult<Vec<String>> {
        let mut names = Vec::new();
        while !self.at_line_end() {
            names.push(self.read_identifier()?.to_string());
            self.try_read(',');
        }
        Ok(names)
    }

    fn parse_unit(&mut self) -> ParseResult<CodeUnit> {
        let name = self.read_identifier()?;
        let mut unit = CodeUnit::new(name);
        self.labels.clear();
        self.jump_resolves.clear();

        self.expect('(')?;
        if !self.try_read(')') {
            loop {
                unit.varnames.push(self.read_identifier()?.to_string());
                if self.try_read(')') {
                    break;
                }
                self.expect(',')?;
            }
        }
        unit.argcount = unit.varnames.len();
        self.expect('{')?;

        let mut stacksize = None;
        loop {
            self.skip_whitespace(true);
            match self.current_char() {
                None => return self.error(format!("unterminated code unit `{}`", name)),
                Some('}') => {
                    self.advance();
                    break;
                }
                Some('.') => {
                    self.advance();
                    let directive = self.read_identifier()?;
                    match directive {
                        "locals" => {
                            for local in self.read_name_list()? {
                                if unit.varnames.contains(&local) {
                                    return self.error(format!("local `{}` declared twice", local));
                                }
                                unit.varnames.push(local);
                            }
                        }
                        "cellvars" => unit.cellvars.extend(self.read_name_list()?),
                        "freevars" => unit.freevars.extend(self.read_name_list()?),
                        "stacksize" => stacksize = Some(self.read_integer()?.max(0) as usize),
                        "flags" => unit.flags = self.read_integer()? as u32,
                        other => return self.error(format!("unknown directive .{}", other)),
                    }
                }
                Some(_) => self.parse_line(&mut unit)?,
            }
        }

        for &(index, label, line) in &self.jump_resolves {
            match self.labels.get(label) {
                Some(&target) => unit.instrs[index].target = Some(target),
                None => {
                    return Err(ParseError {
                        line,
                        message: format!("undefined label `{}`", label),
                    })
                }
            }
        }

        // Units the translator will reject still parse; their stack size stays 0.
        unit.stacksize = match stacksize {
            Some(size) => size,
            None => unit.compute_stacksize().unwrap_or(0),
        };
        Ok(unit)
    }

    /// A label, an instruction, or a label followed by an instruction.
    fn parse_line(&mut self, unit: &mut CodeUnit) -> ParseResult<()> {
        let word = self.read_while(|ch| ch.is_alphanumeric() || ch == '_' || ch == '+');
        if word.is_empty() {
            return self.error(format!("unexpected {:?}", self.current_char()));
        }

        if self.try_read(':') {
            if self.labels.insert(word, unit.instrs.len()).is_some() {
                return self.error(format!("label `{}` defined twice", word));
            }
            if self.at_line_end() {
                return Ok(());
            }
            return self.parse_line(unit);
        }

        let opcode = match Opcode::from_name(word) {
            Some(op) => op,
            None => return self.error(format!("unknown opcode `{}`", word)),
        };
        let mut instr = Instr::new(opcode, None);
        match opcode.operand_kind() {
            OperandKind::None => {}
            OperandKind::Const => {
                let value = self.parse_literal()?;
                instr.arg = Some(unit.const_index(value) as i32);
            }
            OperandKind::Name => {
                let name = self.read_identifier()?;
                instr.arg = Some(unit.name_index(name) as i32);
            }
            OperandKind::Local => {
                instr.arg = Some(self.read_slot(&unit.varnames, "local")?);
            }
            OperandKind::Cell => {
                let cells: Vec<String> = unit
                    .cellvars
                    .iter()
                    .chain(unit.freevars.iter())
                    .cloned()
                    .collect();
                instr.arg = Some(self.read_slot(&cells, "cell")?);
            }
            OperandKind::Count | OperandKind::CallArgs => {
                instr.arg = Some(self.read_integer()? as i32);
            }
            OperandKind::Compare => instr.arg = Some(self.read_compare()?),
            OperandKind::Jump => {
                let label = self.read_identifier()?;
                self.jump_resolves.push((unit.instrs.len(), label, self.line()));
            }
        }

        if !self.at_line_end() {
            return self.error(format!("unexpected text after {}", opcode));
        }
        unit.instrs.push(instr);
        Ok(())
    }

    fn read_slot(&mut self, names: &[String], what: &str) -> ParseResult<i32> {
        self.skip_whitespace(false);
        if matches!(self.current_char(), Some(ch) if ch.is_ascii_digit()) {
            return Ok(self.read_integer()? as i32);
        }
        let name = self.read_identifier()?;
        match names.iter().position(|n| n == name) {
            Some(i) => Ok(i as i32),
            None => self.error(format!("unknown {} `{}`", what, name)),
        }
    }

    fn read_compare(&mut self) -> ParseResult<i32> {
        self.skip_whitespace(false);
        if matches!(self.current_char(), Some(ch) if ch.is_ascii_digit()) {
            return Ok(self.read_integer()? as i32);
        }
        let symbol = self.read_while(|ch| ch != '\n' && ch != ';').trim();
        let op = match symbol {
            "exc_match" => Some(CmpOp::ExcMatch),
            other => CmpOp::from_symbol(other),
        };
        match op {
            Some(op) => Ok(op.arg()),
            None => self.error(format!("unknown comparison `{}`", symbol)),
        }
    }

    fn parse_literal(&mut self) -> ParseResult<Const> {
        self.skip_whitespace(false);
        match self.current_char() {
            Some('"') => self.parse_string().map(Const::Str),
            Some('(') => {
                self.advance();
                let mut items = Vec::new();
                loop {
                    if self.try_read(')') {
                        break;
                    }
                    items.push(self.parse_literal()?);
                    if !self.try_read(',') {
                        self.expect(')')?;
                        break;
                    }
                }
                Ok(Const::Tuple(items))
            }
            Some(ch) if ch == '-' || ch.is_ascii_digit() => self.read_integer().map(Const::Int),
            Some(_) => match self.read_identifier()? {
                "None" => Ok(Const::None),
                "True" => Ok(Const::True),
                "False" => Ok(Const::False),
                other => self.error(format!("unknown literal `{}`", other)),
            },
            None => self.error("expected literal"),
        }
    }

    fn parse_string(&mut self) -> ParseResult<String> {
        self.expect('"')?;
        let mut out = String::new();
        loop {
            let ch = match self.current_char() {
                None | Some('\n') => return self.error("unterminated string literal"),
                Some(ch) => ch,
            };
            self.advance();
            match ch {
                '"' => return Ok(out),
                '\\' => out.push(self.parse_escape()?),
                other => out.push(other),
            }
        }
    }

    fn parse_escape(&mut self) -> ParseResult<char> {
        let ch = match self.current_char() {
            Some(ch) => ch,
            None => return self.error("malformed escape sequence at end of input"),
        };
        self.advance();
        match ch {
            'n' => Ok('\n'),
            't' => Ok('\t'),
            'r' => Ok('\r'),
            '0' => Ok('\0'),
            '\\' => Ok('\\'),
            '"' => Ok('"'),
            '\'' => Ok('\''),
            'x' => {
                let start = self.pos;
                for _ in 0..2 {
                    match self.current_char() {
                        Some(c) if c.is_ascii_hexdigit() => self.advance(),
                        _ => return self.error("malformed \\x escape sequence"),
                    }
                }
                let code = u8::from_str_radix(&self.text[start..self.pos], 16)
                    .map_err(|e| ParseError {
                        line: self.line(),
                        message: format!("malformed \\x escape sequence: {}", e),
                    })?;
                Ok(char::from(code))
            }
            other => self.error(format!("malformed escape sequence `\\{}`", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_add() {
        let units = parse_module(
            r#"
; a + b
code add(a, b) {
    LOAD_FAST a
    LOAD_FAST b
    BINARY_ADD
    RETURN_VALUE
}
"#,
        )
        .unwrap();
        assert_eq!(units.len(), 1);
        let add = &units[0];
        assert_eq!(add.name, "add");
        assert_eq!(add.argcount, 2);
        assert_eq!(add.instrs.len(), 4);
        assert_eq!(add.instrs[1], Instr::new(Opcode::LoadFast, Some(1)));
        assert_eq!(add.stacksize, 2);
    }

    #[test]
    fn test_labels_and_literals() {
        let units = parse_module(
            r#"
code f(x) {
    .locals y
    .stacksize 7
start:
    LOAD_CONST (1, "a\tb", None)
    POP_TOP
    LOAD_GLOBAL len
    LOAD_FAST x
    COMPARE_OP not in
    POP_JUMP_IF_TRUE start
    LOAD_CONST -3
    RETURN_VALUE
}
"#,
        )
        .unwrap();
        let f = &units[0];
        assert_eq!(f.varnames, vec!["x".to_string(), "y".to_string()]);
        assert_eq!(f.stacksize, 7);
        assert_eq!(
            f.consts[0],
            Const::Tuple(vec![Const::Int(1), Const::Str("a\tb".to_string()), Const::None])
        );
        assert_eq!(f.consts[1], Const::Int(-3));
        assert_eq!(f.names, vec!["len".to_string()]);
        assert_eq!(f.instrs[4].arg, Some(CmpOp::NotIn.arg()));
        assert_eq!(f.instrs[5].target, Some(0));
    }

    #[test]
    fn test_malformed_escape_rejected() {
        let err = parse_module("code f() {\n  LOAD_CONST \"a\\q\"\n  RETURN_VALUE\n}\n").unwrap_err();
        assert_eq!(err.line, 2);
        assert!(err.message.contains("malformed escape"));
    }

    #[test]
    fn test_undefined_label_and_unknown_opcode() {
        let err = parse_module("code f() {\n  JUMP_ABSOLUTE nowhere\n}\n").unwrap_err();
        assert!(err.message.contains("undefined label"));

        let err = parse_module("code f() {\n  FROB\n}\n").unwrap_err();
        assert!(err.message.contains("unknown opcode `FROB`"));
    }

    #[test]
    fn test_cells_by_name() {
        let units = parse_module(
            "code f() {\n  .cellvars c\n  .freevars g\n  LOAD_DEREF g\n  RETURN_VALUE\n}\n",
        )
        .unwrap();
        assert_eq!(units[0].instrs[0].arg, Some(1));
    }
}
