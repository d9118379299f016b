//! Registration artifacts rendered from a `ServiceDescriptor`.

use super::ServiceDescriptor;

pub const SYSTEMD_UNIT: &str = r#"[Unit]
Description={{Description}}
ConditionFileIsExecutable={{Path}}
{{Dependencies}}

[Service]
StartLimitInterval=5
StartLimitBurst=10
ExecStart={{ExecStart}}
Restart=always
RestartSec=120
EnvironmentFile=-/etc/sysconfig/{{Name}}

[Install]
WantedBy=multi-user.target
"#;

pub const SYSV_SCRIPT: &str = r#"#!/bin/sh
# For RedHat and cousins:
# chkconfig: - 99 01
# description: {{Description}}
# processname: {{Path}}

### BEGIN INIT INFO
# Provides:          {{Name}}
# Required-Start:
# Required-Stop:
# Default-Start:     2 3 4 5
# Default-Stop:      0 1 6
# Short-Description: {{DisplayName}}
# Description:       {{Description}}
### END INIT INFO

name=$(basename "$0")
pid_file="/var/run/$name.pid"
stdout_log="/var/log/$name.out"
stderr_log="/var/log/$name.err"

get_pid() {
    cat "$pid_file"
}

is_running() {
    [ -f "$pid_file" ] && kill -0 "$(get_pid)" > /dev/null 2>&1
}

case "$1" in
    start)
        if is_running; then
            echo "Already started"
        else
            echo "Starting $name"
            {{ExecStart}} >> "$stdout_log" 2>> "$stderr_log" &
            echo $! > "$pid_file"
            if ! is_running; then
                echo "Unable to start, see $stdout_log and $stderr_log"
                exit 1
            fi
        fi
    ;;
    stop)
        if is_running; then
            echo -n "Stopping $name.."
            kill "$(get_pid)"
            for i in $(seq 1 10)
            do
                if ! is_running; then
                    break
                fi
                echo -n "."
                sleep 1
            done
            echo
            if is_running; then
                echo "Not stopped; may still be shutting down or shutdown may have failed"
                exit 1
            else
                echo "Stopped"
                rm -f "$pid_file"
            fi
        else
            echo "Not running"
        fi
    ;;
    restart)
        $0 stop
        if is_running; then
            echo "Unable to stop, will not attempt to start"
            exit 1
        fi
        $0 start
    ;;
    status)
        if is_running; then
            echo "Running"
        else
            echo "Stopped"
            exit 1
        fi
    ;;
    *)
    echo "Usage: $0 {start|stop|restart|status}"
    exit 1
    ;;
esac
exit 0
"#;

pub const LAUNCHD_PLIST: &str = r#"<?xml version='1.0' encoding='UTF-8'?>
<!DOCTYPE plist PUBLIC "-//Apple Computer//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd" >
<plist version='1.0'>
  <dict>
    <key>Label</key>
    <string>{{Name}}</string>
    <key>ProgramArguments</key>
    <array>
{{ProgramArguments}}
    </array>
    <key>KeepAlive</key>
    <true/>
    <key>RunAtLoad</key>
    <true/>
    <key>Disabled</key>
    <false/>
  </dict>
</plist>
"#;

/// How the command line is quoted inside the artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quoting {
    /// systemd `ExecStart=` word splitting.
    Systemd,
    /// POSIX shell words.
    Shell,
    /// One `<string>` element per word.
    Plist,
}

pub fn render(template: &str, descriptor: &ServiceDescriptor, quoting: Quoting) -> String {
    let path = descriptor.executable.to_string_lossy();
    let words: Vec<&str> = std::iter::once(path.as_ref())
        .chain(descriptor.arguments.iter().map(String::as_str))
        .collect();

    let exec_start = match quoting {
        Quoting::Systemd => words
            .iter()
            .map(|w| systemd_quote(w))
            .collect::<Vec<_>>()
            .join(" "),
        Quoting::Shell => words
            .iter()
            .map(|w| shell_quote(w))
            .collect::<Vec<_>>()
            .join(" "),
        Quoting::Plist => words
            .iter()
            .map(|w| format!("      <string>{}</string>", xml_escape(w)))
            .collect::<Vec<_>>()
            .join("\n"),
    };

    let (name, description) = if quoting == Quoting::Plist {
        (xml_escape(&descriptor.name), xml_escape(&descriptor.description))
    } else {
        (descriptor.name.clone(), descriptor.description.clone())
    };

    template
        .replace("{{Name}}", &name)
        .replace("{{DisplayName}}", &descriptor.display_name)
        .replace("{{Description}}", &description)
        .replace("{{Path}}", &path)
        .replace("{{Dependencies}}", &descriptor.dependencies.join("\n"))
        .replace("{{ExecStart}}", &exec_start)
        .replace("{{ProgramArguments}}", &exec_start)
}

fn systemd_quote(word: &str) -> String {
    if !word.is_empty() && !word.contains(|c: char| c.is_whitespace() || c == '"' || c == '\\') {
        return word.to_string();
    }
    let escaped = word.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}

fn shell_quote(word: &str) -> String {
    let safe = |c: char| c.is_ascii_alphanumeric() || "-_./=:@,+%".contains(c);
    if !word.is_empty() && word.chars().all(safe) {
        return word.to_string();
    }
    format!("'{}'", word.replace('\'', r"'\''"))
}

fn xml_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}
