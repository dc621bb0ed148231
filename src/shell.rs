use crate::helper::DynError;
use crate::parser::{self, Pipeline, Stage};
use nix::{
    libc,
    sys::wait::{waitpid, WaitPidFlag, WaitStatus},
    unistd::{self, dup2, execvp, fork, pipe, ForkResult, Pid},
};
use rustyline::{error::ReadlineError, Editor};
use signal_hook::{consts::SIGINT, flag};
use std::{
    ffi::CString,
    fs::{File, OpenOptions},
    os::unix::io::{IntoRawFd, RawFd},
    process::exit,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

/// コマンド実行後にループをどうするか
enum Control {
    Continue, // 読み込みを再開
    Quit,     // シェルを終了
}

#[derive(Debug)]
pub struct Shell {
    logfile: String,              // ヒストリファイル
    exit_val: i32,                // 直前の終了コード
    interrupted: Arc<AtomicBool>, // SIGINT受信フラグ
}

impl Shell {
    pub fn new(logfile: &str) -> Self {
        Shell {
            logfile: logfile.to_string(),
            exit_val: 0,
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// 対話ループ
    pub fn run(&mut self) -> Result<(), DynError> {
        // SIGINTでシェル自体が終了しないように、フラグを立てるだけの
        // ハンドラを登録。通知はブロッキング読み込みから戻った後に行う
        flag::register(SIGINT, Arc::clone(&self.interrupted))?;

        let mut rl = Editor::<()>::new()?;
        if let Err(e) = rl.load_history(&self.logfile) {
            eprintln!("PipeSh: ヒストリファイルの読み込みに失敗: {e}");
        }

        let exit_val; // 終了コード
        loop {
            if self.interrupted.swap(false, Ordering::Relaxed) {
                eprintln!("PipeSh: 割り込みを受信");
            }

            // 1行読み込んで実行
            let face = if self.exit_val == 0 { '\u{1F642}' } else { '\u{1F480}' };
            match rl.readline(&format!("PipeSh {face} %> ")) {
                Ok(line) => {
                    let line_trimed = line.trim(); // 前後の空白文字を削除

                    // 空のコマンドは実行せず再読み込み
                    if !line_trimed.is_empty() {
                        rl.add_history_entry(line_trimed); // ヒストリファイルに追加

                        match parser::parse(line_trimed) {
                            Ok(pipeline) => {
                                if let Control::Quit = self.dispatch(&pipeline) {
                                    exit_val = 0;
                                    break;
                                }
                            }
                            Err(e) => {
                                eprintln!("PipeSh: {e}");
                                self.exit_val = 1;
                            }
                        }
                    }

                    self.reap_children(); // 空行の場合も含め、毎周ゾンビを回収
                }
                Err(ReadlineError::Interrupted) => eprintln!("PipeSh: 終了はCtrl+D"),
                Err(ReadlineError::Eof) => {
                    // 入力の終端に達したら正常終了
                    exit_val = 0;
                    break;
                }
                Err(e) => {
                    eprintln!("PipeSh: 読み込みエラー\n{e}");
                    exit_val = 1;
                    break;
                }
            }
        }

        if let Err(e) = rl.save_history(&self.logfile) {
            eprintln!("PipeSh: ヒストリファイルの書き込みに失敗: {e}");
        }
        exit(exit_val);
    }

    /// 組み込みコマンドを処理し、それ以外はパイプラインとして実行。
    /// 組み込みコマンドはパイプ無しの場合のみ有効
    fn dispatch(&mut self, pipeline: &Pipeline) -> Control {
        if pipeline.stages.len() == 1 {
            let args = &pipeline.stages[0].args;
            match args[0].as_str() {
                "cd" => {
                    self.run_cd(args);
                    return Control::Continue;
                }
                "exit" => return Control::Quit, // 引数は無視
                _ => (),
            }
        }

        self.spawn_pipeline(pipeline);
        Control::Continue
    }

    /// カレントディレクトリを変更。引数が無い場合はエラー。第2引数以降は無視
    fn run_cd(&mut self, args: &[String]) {
        if args.len() < 2 {
            eprintln!("PipeSh: cdには引数が必要");
            self.exit_val = 1;
            return;
        }

        if let Err(e) = std::env::set_current_dir(&args[1]) {
            eprintln!("PipeSh: cdに失敗: {e}");
            self.exit_val = 1;
        } else {
            self.exit_val = 0;
        }
    }

    /// パイプラインの各ステージを左から順にforkし、パイプで接続して実行。
    /// フォアグラウンドの場合は全ステージを起動した後、子プロセスごとに
    /// 終了を待つ。ステージのforkより前に待つと、パイプバッファを超える
    /// データで上流のステージが書き込みブロックしたままデッドロックする
    fn spawn_pipeline(&mut self, pipeline: &Pipeline) {
        let n = pipeline.stages.len();
        let mut prev_read: Option<RawFd> = None; // 前段のパイプの読み込み側
        let mut children = Vec::with_capacity(n);
        let mut failed = false;

        for (i, stage) in pipeline.stages.iter().enumerate() {
            // 後続のステージがある場合のみパイプを作成
            let pipe_fds = if i < n - 1 {
                match syscall(|| pipe()) {
                    Ok(p) => Some(p),
                    Err(e) => {
                        eprintln!("PipeSh: パイプの作成に失敗: {e}");
                        close_opt(prev_read);
                        failed = true;
                        break;
                    }
                }
            } else {
                None
            };

            match syscall(|| unsafe { fork() }) {
                Ok(ForkResult::Child) => {
                    let (output, unused) = match pipe_fds {
                        Some((read, write)) => (Some(write), Some(read)),
                        None => (None, None),
                    };
                    exec_stage(stage, prev_read, output, unused);
                }
                Ok(ForkResult::Parent { child }) => {
                    // 不要になったfdは直ちにクローズする。書き込み側が
                    // 親に残っていると、下流のステージがEOFを検出できない
                    if let Some((_, write)) = pipe_fds {
                        close_fd(write);
                    }
                    close_opt(prev_read);
                    children.push(child);

                    // 読み込み側は次のステージの標準入力になる
                    prev_read = pipe_fds.map(|(read, _)| read);
                }
                Err(e) => {
                    eprintln!("PipeSh: プロセス生成エラー: {e}");
                    if let Some((read, write)) = pipe_fds {
                        close_fd(read);
                        close_fd(write);
                    }
                    close_opt(prev_read);
                    failed = true;
                    break;
                }
            }
        }

        if !pipeline.background {
            // 起動済みの子プロセスを順に待つ。最後のステージの
            // 終了コードが残る
            for child in children {
                self.wait_foreground(child);
            }
        }

        if failed {
            self.exit_val = 1;
        }
    }

    /// フォアグラウンドの子プロセスの終了を待ち、終了コードを記録
    fn wait_foreground(&mut self, child: Pid) {
        match syscall(|| waitpid(child, None)) {
            Ok(WaitStatus::Exited(_, status)) => self.exit_val = status,
            Ok(WaitStatus::Signaled(pid, sig, core)) => {
                eprintln!(
                    "\nPipeSh: 子プロセスがシグナルにより終了{}: pid = {pid}, signal = {sig}",
                    if core { "（コアダンプ）" } else { "" }
                );
                self.exit_val = sig as i32 + 128;
            }
            Ok(_) => (),
            Err(e) => {
                eprintln!("PipeSh: waitが失敗: {e}");
                self.exit_val = 1;
            }
        }
    }

    /// 終了済みのバックグラウンド子プロセスをノンブロッキングで回収し、
    /// ゾンビの蓄積を防ぐ。ループ1周につき1回呼び出す
    fn reap_children(&mut self) {
        loop {
            match syscall(|| waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG))) {
                Ok(WaitStatus::StillAlive) => return, // waitすべき子プロセスはいない
                Err(nix::Error::ECHILD) => return,    // 子プロセスはいない
                Ok(_) => (),                          // 回収した
                Err(e) => {
                    eprintln!("PipeSh: waitが失敗: {e}");
                    return;
                }
            }
        }
    }
}

/// 子プロセス側で標準入出力を配線し、execvpでプロセスを置き換える。
/// この関数から戻ることはない
fn exec_stage(
    stage: &Stage,
    input: Option<RawFd>,
    output: Option<RawFd>,
    unused: Option<RawFd>,
) -> ! {
    if let Err(e) = wire_and_exec(stage, input, output, unused) {
        eprintln!("PipeSh: {e}");
    }
    exit(1);
}

/// パイプのfdを標準入出力に配線した後、ファイルへのリダイレクトを適用し、
/// 最後にexecvpを呼び出す。成功した場合は戻らない
fn wire_and_exec(
    stage: &Stage,
    input: Option<RawFd>,
    output: Option<RawFd>,
    unused: Option<RawFd>,
) -> Result<(), DynError> {
    // 使わない読み込み側を先にクローズ
    if let Some(fd) = unused {
        syscall(|| unistd::close(fd))?;
    }
    if let Some(fd) = input {
        dup_over(fd, libc::STDIN_FILENO)?;
    }
    if let Some(fd) = output {
        dup_over(fd, libc::STDOUT_FILENO)?;
    }

    // ファイルへのリダイレクト。パーサが先頭・末尾ステージにのみ設定する
    // ため、パイプの配線と衝突することはない
    if let Some(path) = &stage.redirect.input {
        let file = File::open(path).map_err(|e| format!("{path}: {e}"))?;
        dup_over(file.into_raw_fd(), libc::STDIN_FILENO)?;
    }
    if let Some(path) = &stage.redirect.output {
        let file = open_trunc(path)?;
        dup_over(file.into_raw_fd(), libc::STDOUT_FILENO)?;
    }
    if let Some(path) = &stage.redirect.error {
        let file = open_trunc(path)?;
        dup_over(file.into_raw_fd(), libc::STDERR_FILENO)?;
    }

    let filename = CString::new(stage.args[0].as_str())?;
    let args: Result<Vec<CString>, _> = stage
        .args
        .iter()
        .map(|s| CString::new(s.as_str()))
        .collect();
    let args = args?;

    // 実行ファイルをメモリに読み込み
    match execvp(&filename, &args) {
        Err(_) => {
            unistd::write(
                libc::STDERR_FILENO,
                format!("PipeSh: コマンドが見つからない: {}\n", stage.args[0]).as_bytes(),
            )
            .ok();
            exit(1);
        }
        Ok(_) => unreachable!(),
    }
}

/// 書き込み用にファイルを開く。無ければ作成し、あれば空にする
fn open_trunc(path: &str) -> Result<File, DynError> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(|e| format!("{path}: {e}").into())
}

/// fdを標準ストリームのスロットに複製し、元のfdをクローズ
fn dup_over(fd: RawFd, slot: RawFd) -> Result<(), nix::Error> {
    syscall(|| dup2(fd, slot))?;
    syscall(|| unistd::close(fd))?;
    Ok(())
}

fn close_fd(fd: RawFd) {
    let _ = syscall(|| unistd::close(fd));
}

fn close_opt(fd: Option<RawFd>) {
    if let Some(fd) = fd {
        close_fd(fd);
    }
}

/// システムコール呼び出しのラッパ。EINTRならリトライ
fn syscall<F, T>(f: F) -> Result<T, nix::Error>
where
    F: Fn() -> Result<T, nix::Error>,
{
    loop {
        match f() {
            Err(nix::Error::EINTR) => (), // リトライ
            result => return result,
        }
    }
}
