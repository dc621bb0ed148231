//! 入力1行をトークンに分割し、パイプラインに変換

use std::{
    error::Error,
    fmt::{self, Display},
};

/// パースエラーを表すための型
#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    EmptyCommand,                   // 空のコマンド
    NoRedirectTarget(&'static str), // リダイレクト先のファイル名が無い
}

/// パースエラーを表示するために、Displayトレイトを実装
impl Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::EmptyCommand => write!(f, "ParseError: empty command"),
            ParseError::NoRedirectTarget(op) => {
                write!(f, "ParseError: no redirect target: op = '{op}'")
            }
        }
    }
}

impl Error for ParseError {} // エラー用に、Errorトレイトを実装

/// リダイレクト指定。各ストリームにつき高々1つのファイルを保持し、
/// 同じ演算子が複数回現れた場合は後のものが優先される
#[derive(Debug, PartialEq, Eq, Default)]
pub struct Redirect {
    pub input: Option<String>,  // <
    pub output: Option<String>, // >
    pub error: Option<String>,  // 2>
}

/// パイプラインの1ステージ。exec用の引数列とリダイレクト指定。
/// argsは空にならず、リダイレクトの演算子とファイル名は取り除かれている
#[derive(Debug, PartialEq, Eq)]
pub struct Stage {
    pub args: Vec<String>,
    pub redirect: Redirect,
}

/// パース済みのコマンド行全体
#[derive(Debug, PartialEq, Eq)]
pub struct Pipeline {
    pub stages: Vec<Stage>,
    pub background: bool,
}

/// コマンド行をパースし、ステージの列とバックグラウンド実行の
/// フラグにわける。クォートは解釈しない
///
/// # 例1
///
/// 入力"echo abc def"に対して、引数が`["echo", "abc", "def"]`の
/// ステージを1つ持つパイプラインを返す。
///
/// # 例2
///
/// 入力"echo abc | less &"に対して、ステージ`["echo", "abc"]`と
/// `["less"]`を持ち、backgroundが真のパイプラインを返す。
pub fn parse(line: &str) -> Result<Pipeline, ParseError> {
    let mut tokens = tokenize(line);
    let background = take_background(&mut tokens); // セグメント分割より先に判定
    let raw_stages = split_on_pipe(tokens);

    let n = raw_stages.len();
    let mut stages = Vec::with_capacity(n);
    for (i, toks) in raw_stages.into_iter().enumerate() {
        stages.push(extract_redirect(toks, i == 0, i == n - 1)?);
    }

    Ok(Pipeline { stages, background })
}

/// 空白文字でsplit
fn tokenize(line: &str) -> Vec<String> {
    line.split_whitespace().map(|s| s.to_string()).collect()
}

/// 末尾のトークンが&なら取り除き、バックグラウンド実行と判定。
/// 空のトークン列はフォアグラウンド扱い
fn take_background(tokens: &mut Vec<String>) -> bool {
    if tokens.last().map(|s| s.as_str()) == Some("&") {
        tokens.pop();
        true
    } else {
        false
    }
}

/// トークン列を|でステージごとに分割。
/// 先頭・末尾・連続した|は空のステージを生み、後段でエラーになる
fn split_on_pipe(tokens: Vec<String>) -> Vec<Vec<String>> {
    let mut stages = vec![Vec::new()];
    for tok in tokens {
        if tok == "|" {
            stages.push(Vec::new());
        } else {
            stages.last_mut().unwrap().push(tok);
        }
    }
    stages
}

/// ステージのトークン列からリダイレクト指定を抽出し、exec用の引数列を生成。
/// 入力リダイレクトは先頭ステージのみ、出力・エラーリダイレクトは末尾
/// ステージのみ解釈する。中間ステージの標準入出力は常にパイプなので、
/// そこに現れた演算子は通常の引数として扱う
fn extract_redirect(
    tokens: Vec<String>,
    is_first: bool,
    is_last: bool,
) -> Result<Stage, ParseError> {
    let mut args = Vec::new();
    let mut redirect = Redirect::default();

    let mut it = tokens.into_iter();
    while let Some(tok) = it.next() {
        match tok.as_str() {
            "<" if is_first => {
                let target = it.next().ok_or(ParseError::NoRedirectTarget("<"))?;
                redirect.input = Some(target);
            }
            ">" if is_last => {
                let target = it.next().ok_or(ParseError::NoRedirectTarget(">"))?;
                redirect.output = Some(target);
            }
            "2>" if is_last => {
                let target = it.next().ok_or(ParseError::NoRedirectTarget("2>"))?;
                redirect.error = Some(target);
            }
            _ => args.push(tok),
        }
    }

    // 空のステージはexecを試みる前にエラーにする
    if args.is_empty() {
        return Err(ParseError::EmptyCommand);
    }

    Ok(Stage { args, redirect })
}
